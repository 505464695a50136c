pub mod archive;
pub mod file;
pub mod paths;
pub mod process;
