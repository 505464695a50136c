use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::errors::{ManagerError, Result};
use crate::utils::process::hide_console_window;

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallResult {
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Platform command that allows inbound UDP on `port`.
pub fn firewall_rule_command(port: u16) -> Result<RuleCommand> {
    rule_command_for(std::env::consts::OS, port)
}

fn rule_command_for(os: &str, port: u16) -> Result<RuleCommand> {
    match os {
        "windows" => Ok(RuleCommand {
            program: "netsh".to_string(),
            args: vec![
                "advfirewall".to_string(),
                "firewall".to_string(),
                "add".to_string(),
                "rule".to_string(),
                format!("name=Hytale Server {port}"),
                "dir=in".to_string(),
                "action=allow".to_string(),
                "protocol=UDP".to_string(),
                format!("localport={port}"),
            ],
        }),
        "linux" => Ok(RuleCommand {
            program: "ufw".to_string(),
            args: vec!["allow".to_string(), format!("{port}/udp")],
        }),
        other => Err(ManagerError::Config(format!(
            "firewall setup is not supported on {other}"
        ))),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FirewallService;

impl FirewallService {
    pub async fn open_port(&self, port: u16) -> Result<FirewallResult> {
        let rule = firewall_rule_command(port)?;
        let mut command = Command::new(&rule.program);
        command
            .args(&rule.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        hide_console_window(&mut command);

        let output = command.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            tracing::info!("opened UDP port {} via {}", port, rule.program);
            Ok(FirewallResult {
                success: true,
                message: if stdout.is_empty() {
                    format!("UDP port {port} opened")
                } else {
                    stdout
                },
            })
        } else {
            tracing::warn!("{} failed for port {}: {}", rule.program, port, stderr);
            Ok(FirewallResult {
                success: false,
                message: if stderr.is_empty() { stdout } else { stderr },
            })
        }
    }
}
