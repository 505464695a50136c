use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::errors::{ManagerError, Result};
use crate::models::{ConsoleLevel, ServerEvent};
use crate::services::event_bus::EventBus;
use crate::services::profile_store::ProfileService;
use crate::services::update_service::download_to_path;
use crate::settings::ManagerSettings;
use crate::utils::archive::{extract_zip, single_root_depth};
use crate::utils::file::{mark_executable, sibling_with_suffix};
use crate::utils::process::hide_console_window;

pub const CREDENTIALS_FILE: &str = ".hytale-downloader-credentials.json";
const JAVA_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JavaStatus {
    Bundled,
    System,
    Missing,
}

impl JavaStatus {
    pub fn installed(self) -> bool {
        !matches!(self, JavaStatus::Missing)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub success: bool,
    pub message: Option<String>,
    pub credentials_saved: bool,
}

#[derive(Debug, Deserialize)]
struct DownloaderCredentials {
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Platform-specific name of the downloader CLI binary.
pub fn downloader_file_name() -> &'static str {
    if cfg!(windows) {
        "hytale-downloader-windows-amd64.exe"
    } else {
        "hytale-downloader-linux-amd64"
    }
}

/// Where the downloader may have left its credentials, most specific first.
pub fn credential_candidates(server_dir: &Path, tools_dir: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![server_dir.join(CREDENTIALS_FILE), tools_dir.join(CREDENTIALS_FILE)];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(CREDENTIALS_FILE));
    }
    candidates
}

/// Reads `refresh_token` from the first credentials file that exists.
pub fn harvest_refresh_token(candidates: &[PathBuf]) -> Result<Option<String>> {
    let Some(found) = candidates.iter().find(|path| path.is_file()) else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(found)?;
    let parsed: DownloaderCredentials = serde_json::from_str(&raw)?;
    Ok(parsed
        .refresh_token
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty()))
}

/// Downloader CLI, Java runtime and CLI-driven installs.
#[derive(Clone)]
pub struct ToolService {
    tools_dir: PathBuf,
    runtime_dir: PathBuf,
    bundled_java: PathBuf,
    downloader_url: String,
    java_runtime_url: Option<String>,
    client: reqwest::Client,
    events: EventBus,
    profiles: ProfileService,
}

impl ToolService {
    pub fn new(
        settings: &ManagerSettings,
        client: reqwest::Client,
        events: EventBus,
        profiles: ProfileService,
    ) -> Self {
        Self {
            tools_dir: settings.tools_dir(),
            runtime_dir: settings.runtime_dir(),
            bundled_java: settings.bundled_java(),
            downloader_url: settings.file.downloader_url.clone(),
            java_runtime_url: settings.file.java_runtime_url.clone(),
            client,
            events,
            profiles,
        }
    }

    pub fn downloader_path(&self) -> PathBuf {
        self.tools_dir.join(downloader_file_name())
    }

    pub fn cli_tool_installed(&self) -> bool {
        self.downloader_path().is_file()
    }

    pub async fn download_cli_tool(&self) -> Result<PathBuf> {
        let archive = self.tools_dir.join("hytale-downloader.zip");
        let bytes = download_to_path(&self.client, &self.downloader_url, &archive).await?;
        tracing::info!("downloaded downloader archive ({} bytes)", bytes);

        let tools_dir = self.tools_dir.clone();
        let extracted = unpack(archive.clone(), tools_dir, false).await;
        let _ = tokio::fs::remove_file(&archive).await;
        let files = extracted?;

        let binary = self.downloader_path();
        if !binary.is_file() {
            return Err(ManagerError::NotFound(format!(
                "{} missing from downloaded archive ({} files extracted)",
                downloader_file_name(),
                files
            )));
        }
        mark_executable(&binary)?;
        Ok(binary)
    }

    pub async fn java_status(&self) -> JavaStatus {
        if self.bundled_java.is_file() {
            return JavaStatus::Bundled;
        }
        let mut command = Command::new("java");
        command
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        hide_console_window(&mut command);
        match tokio::time::timeout(JAVA_PROBE_TIMEOUT, command.status()).await {
            Ok(Ok(status)) if status.success() => JavaStatus::System,
            _ => JavaStatus::Missing,
        }
    }

    /// Replaces the bundled runtime with the zip served at `url`
    /// (or the configured default). Returns the runtime's `java` path.
    pub async fn download_java_runtime(&self, url: Option<&str>) -> Result<PathBuf> {
        let url = url
            .map(str::to_string)
            .or_else(|| self.java_runtime_url.clone())
            .ok_or_else(|| {
                ManagerError::Config(
                    "no Java runtime download is configured for this platform".to_string(),
                )
            })?;

        let archive = self.tools_dir.join("java-runtime.zip");
        download_to_path(&self.client, &url, &archive).await?;

        let installed = install_runtime(&archive, &self.runtime_dir, &self.bundled_java).await;
        let _ = tokio::fs::remove_file(&archive).await;
        installed?;
        tracing::info!("installed Java runtime from {}", url);
        Ok(self.bundled_java.clone())
    }

    /// Runs the downloader CLI inside the server directory, streaming its
    /// output to the console, and stores any refresh token it leaves behind.
    pub async fn install_via_cli(&self, profile_id: &str) -> Result<InstallResult> {
        let profile = self.profiles.require(profile_id).await?;
        let tool = self.downloader_path();
        if !tool.is_file() {
            return Err(ManagerError::NotFound(
                "downloader CLI is not installed".to_string(),
            ));
        }
        let server_dir = PathBuf::from(&profile.path);
        tokio::fs::create_dir_all(&server_dir).await?;

        let mut command = Command::new(&tool);
        command
            .current_dir(&server_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console_window(&mut command);
        let mut child = command.spawn()?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, self.events.clone(), profile_id, ConsoleLevel::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, self.events.clone(), profile_id, ConsoleLevel::Stderr));
        }
        let status = child.wait().await?;
        futures_util::future::join_all(readers).await;

        if !status.success() {
            let message = match status.code() {
                Some(code) => format!("Exit Code {code}"),
                None => "downloader was terminated".to_string(),
            };
            return Ok(InstallResult {
                success: false,
                message: Some(message),
                credentials_saved: false,
            });
        }

        let candidates = credential_candidates(&server_dir, &self.tools_dir);
        let token = match harvest_refresh_token(&candidates) {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!("could not read downloader credentials: {}", err);
                None
            }
        };
        let mut credentials_saved = false;
        if let Some(token) = token {
            let saved = self
                .profiles
                .modify(profile_id, |stored| stored.refresh_token = Some(token))
                .await?;
            if saved.is_some() {
                credentials_saved = true;
                self.events.console(
                    profile_id,
                    ConsoleLevel::Info,
                    "[Manager] AUTH SAVED! Auto-refresh enabled.",
                );
            }
        }

        Ok(InstallResult {
            success: true,
            message: None,
            credentials_saved,
        })
    }
}

/// Extracts `archive` next to `runtime_dir` and swaps it in only once it holds
/// `java`. The previous runtime stays in place until then, and comes back if
/// the swap fails.
async fn install_runtime(archive: &Path, runtime_dir: &Path, java: &Path) -> Result<()> {
    let relative_java = java.strip_prefix(runtime_dir).map_err(|_| {
        ManagerError::Config(format!(
            "{} is not inside {}",
            java.display(),
            runtime_dir.display()
        ))
    })?;
    let staged = sibling_with_suffix(runtime_dir, "new");
    let backup = sibling_with_suffix(runtime_dir, "bak");
    for leftover in [&staged, &backup] {
        if tokio::fs::try_exists(leftover).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(leftover).await?;
        }
    }

    let extracted = unpack(archive.to_path_buf(), staged.clone(), true).await;
    let staged_java = staged.join(relative_java);
    if let Err(err) = extracted {
        let _ = tokio::fs::remove_dir_all(&staged).await;
        return Err(err);
    }
    if !staged_java.is_file() {
        let _ = tokio::fs::remove_dir_all(&staged).await;
        return Err(ManagerError::NotFound(format!(
            "archive did not contain {}",
            relative_java.display()
        )));
    }

    let had_previous = tokio::fs::try_exists(runtime_dir).await.unwrap_or(false);
    if had_previous {
        tokio::fs::rename(runtime_dir, &backup).await?;
    }
    if let Err(err) = tokio::fs::rename(&staged, runtime_dir).await {
        if had_previous {
            if let Err(restore) = tokio::fs::rename(&backup, runtime_dir).await {
                tracing::error!("failed to restore previous Java runtime: {}", restore);
            }
        }
        let _ = tokio::fs::remove_dir_all(&staged).await;
        return Err(err.into());
    }
    if had_previous {
        if let Err(err) = tokio::fs::remove_dir_all(&backup).await {
            tracing::warn!("could not remove old Java runtime: {}", err);
        }
    }
    mark_executable(java)?;
    Ok(())
}

async fn unpack(archive: PathBuf, dest: PathBuf, strip_root: bool) -> Result<u32> {
    tokio::task::spawn_blocking(move || {
        let depth = if strip_root {
            single_root_depth(&archive)?
        } else {
            0
        };
        extract_zip(&archive, &dest, depth)
    })
    .await
    .map_err(|err| ManagerError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
}

fn forward_lines<R>(
    stream: R,
    events: EventBus,
    profile_id: &str,
    level: ConsoleLevel,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let profile_id = profile_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            events.emit(ServerEvent::log(&profile_id, level, line));
        }
    })
}
