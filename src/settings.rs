use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::utils::paths;

pub const SETTINGS_FILE: &str = "settings.json";
pub const PROFILES_FILE: &str = "servers.json";

/// OAuth endpoints of the identity service the servers authenticate against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthEndpoints {
    pub client_id: String,
    pub scope: String,
    pub token_url: String,
    pub device_url: String,
    pub profiles_url: String,
    pub session_url: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            client_id: "hytale-server".to_string(),
            scope: "openid offline auth:server".to_string(),
            token_url: "https://oauth.accounts.hytale.com/oauth2/token".to_string(),
            device_url: "https://oauth.accounts.hytale.com/oauth2/device/auth".to_string(),
            profiles_url: "https://account-data.hytale.com/my-account/get-profiles".to_string(),
            session_url: "https://sessions.hytale.com/game-session/new".to_string(),
        }
    }
}

/// Contents of `config/settings.json`. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsFile {
    pub auth: AuthEndpoints,
    pub stop_command: String,
    pub shutdown_grace_ms: u64,
    pub http_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
    pub downloader_url: String,
    pub java_runtime_url: Option<String>,
    pub firewall_port: u16,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            auth: AuthEndpoints::default(),
            stop_command: "stop".to_string(),
            shutdown_grace_ms: 3000,
            http_timeout_secs: 20,
            http_connect_timeout_secs: 6,
            downloader_url: "https://downloader.hytale.com/hytale-downloader.zip".to_string(),
            java_runtime_url: default_java_runtime_url(),
            firewall_port: 5520,
        }
    }
}

fn default_java_runtime_url() -> Option<String> {
    if cfg!(all(windows, target_arch = "x86_64")) {
        Some(
            "https://api.adoptium.net/v3/binary/latest/25/ga/windows/x64/jre/hotspot/normal/eclipse"
                .to_string(),
        )
    } else {
        None
    }
}

/// Resolved runtime configuration: directories plus the settings file.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub root_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub file: SettingsFile,
}

impl ManagerSettings {
    /// Resolves directories from the environment and reads `settings.json` if present.
    pub fn load(root_override: Option<PathBuf>) -> Result<Self> {
        let root_dir = match root_override {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                dir
            }
            None => paths::resolve_root_dir(),
        };
        let data_dir = paths::resolve_data_dir(&root_dir);
        let log_dir = paths::resolve_log_dir(&root_dir);
        let file = read_settings_file(&data_dir.join(SETTINGS_FILE))?;

        Ok(Self {
            root_dir,
            data_dir,
            log_dir,
            file,
        })
    }

    /// Settings rooted at `root_dir` with every default; nothing is read from disk.
    pub fn with_root(root_dir: PathBuf) -> Self {
        Self {
            data_dir: root_dir.join("config"),
            log_dir: root_dir.join("logs"),
            root_dir,
            file: SettingsFile::default(),
        }
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.data_dir.join(PROFILES_FILE)
    }

    pub fn backups_dir(&self) -> PathBuf {
        paths::backups_dir(&self.root_dir)
    }

    pub fn tools_dir(&self) -> PathBuf {
        paths::tools_dir(&self.root_dir)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        paths::runtime_dir(&self.root_dir)
    }

    pub fn bundled_java(&self) -> PathBuf {
        paths::bundled_java_path(&self.root_dir)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.file.shutdown_grace_ms)
    }

    pub fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.file.http_timeout_secs))
            .connect_timeout(Duration::from_secs(self.file.http_connect_timeout_secs))
            .user_agent(concat!("hytale-manager/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}

fn read_settings_file(path: &Path) -> Result<SettingsFile> {
    if !path.exists() {
        return Ok(SettingsFile::default());
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(SettingsFile::default());
    }
    Ok(serde_json::from_str(&raw)?)
}
