use std::path::{Component, Path, PathBuf};

use crate::errors::{ManagerError, Result};

pub const APP_DIR_NAME: &str = "hytale-manager";

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

fn env_dir(key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    ensure_dir(&PathBuf::from(trimmed))
}

pub fn resolve_root_dir() -> PathBuf {
    if let Some(dir) = env_dir("HYTALE_MANAGER_ROOT_DIR") {
        return dir;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    if let Some(data) = dirs::data_dir() {
        if let Some(found) = ensure_dir(&data.join(APP_DIR_NAME)) {
            return found;
        }
    }

    PathBuf::from(".")
}

pub fn resolve_data_dir(root: &Path) -> PathBuf {
    let config = root.join("config");
    if let Some(dir) = ensure_dir(&config) {
        return dir;
    }
    root.to_path_buf()
}

pub fn resolve_log_dir(root: &Path) -> PathBuf {
    if let Some(dir) = env_dir("HYTALE_MANAGER_LOG_DIR") {
        return dir;
    }

    let root_logs = root.join("logs");
    if let Some(found) = ensure_dir(&root_logs) {
        return found;
    }

    if let Some(data) = dirs::data_local_dir() {
        let candidate = data.join(APP_DIR_NAME).join("logs");
        if let Some(found) = ensure_dir(&candidate) {
            return found;
        }
    }

    PathBuf::from("logs")
}

pub fn backups_dir(root: &Path) -> PathBuf {
    root.join("backups")
}

pub fn tools_dir(root: &Path) -> PathBuf {
    root.join("bin")
}

pub fn runtime_dir(root: &Path) -> PathBuf {
    root.join("jre")
}

/// Location of the bundled Java runtime's launcher; may not exist.
pub fn bundled_java_path(root: &Path) -> PathBuf {
    let name = if cfg!(windows) { "java.exe" } else { "java" };
    runtime_dir(root).join("bin").join(name)
}

/// Joins a user-supplied relative path onto `base`, refusing anything that
/// would escape it (`..`, absolute paths, drive prefixes).
pub fn resolve_inside(base: &Path, relative: &str) -> Result<PathBuf> {
    let mut output = PathBuf::from(base);
    let mut pushed = false;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(value) => {
                output.push(value);
                pushed = true;
            }
            Component::CurDir => {}
            _ => {
                return Err(ManagerError::Config(format!(
                    "path escapes the server directory: {relative}"
                )))
            }
        }
    }
    if !pushed {
        return Err(ManagerError::Config("empty file name".to_string()));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_inside_accepts_nested_relative_paths() {
        let base = Path::new("/srv/hytale");
        let resolved = resolve_inside(base, "./config/server.json").expect("nested path");
        assert_eq!(resolved, base.join("config").join("server.json"));
    }

    #[test]
    fn resolve_inside_rejects_escapes() {
        let base = Path::new("/srv/hytale");
        assert!(resolve_inside(base, "../etc/passwd").is_err());
        assert!(resolve_inside(base, "config/../../x").is_err());
        assert!(resolve_inside(base, "/etc/passwd").is_err());
        assert!(resolve_inside(base, "").is_err());
    }
}
