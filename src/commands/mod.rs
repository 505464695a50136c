pub mod auth;
pub mod files;
pub mod server;
pub mod tools;
