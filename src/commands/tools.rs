use std::path::PathBuf;

use crate::services::{FirewallResult, InstallResult, JavaStatus};
use crate::AppState;

pub fn check_cli_tool(state: &AppState) -> Result<bool, String> {
    Ok(state.tools.cli_tool_installed())
}

pub async fn download_cli_tool(state: &AppState) -> Result<PathBuf, String> {
    state
        .tools
        .download_cli_tool()
        .await
        .map_err(|err| err.to_string())
}

pub async fn install_via_cli(id: String, state: &AppState) -> Result<InstallResult, String> {
    state
        .tools
        .install_via_cli(&id)
        .await
        .map_err(|err| err.to_string())
}

pub async fn check_java_installed(state: &AppState) -> Result<JavaStatus, String> {
    Ok(state.tools.java_status().await)
}

pub async fn download_java(url: Option<String>, state: &AppState) -> Result<PathBuf, String> {
    state
        .tools
        .download_java_runtime(url.as_deref())
        .await
        .map_err(|err| err.to_string())
}

/// Opens the game port, defaulting to the configured one.
pub async fn setup_firewall(port: Option<u16>, state: &AppState) -> Result<FirewallResult, String> {
    let port = port.unwrap_or(state.settings.file.firewall_port);
    state
        .firewall
        .open_port(port)
        .await
        .map_err(|err| err.to_string())
}
