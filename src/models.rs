use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Absent keeps what is stored, blank clears it, anything else replaces it.
fn merge_secret(slot: &mut Option<String>, incoming: Option<String>) {
    match incoming {
        None => {}
        Some(value) if value.trim().is_empty() => *slot = None,
        Some(value) => *slot = Some(value),
    }
}

/// A stored server profile, serialized exactly as it appears in `servers.json`.
///
/// Keys the manager does not understand (whitelist settings written by other
/// tools, UI preferences, ...) are kept in `extra` and written back untouched.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub jar_file: String,
    #[serde(default)]
    pub java_args: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_identity_token: Option<String>,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_webhook: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hytale_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerProfile {
    pub fn refresh_token(&self) -> Option<&str> {
        non_blank(&self.refresh_token)
    }

    pub fn session_token(&self) -> Option<&str> {
        non_blank(&self.auth_session_token)
    }

    pub fn identity_token(&self) -> Option<&str> {
        non_blank(&self.auth_identity_token)
    }

    pub fn api_key(&self) -> Option<&str> {
        non_blank(&self.hytale_api_key)
    }

    pub fn java_path(&self) -> Option<&str> {
        non_blank(&self.java_path)
    }

    pub fn discord_webhook(&self) -> Option<&str> {
        non_blank(&self.discord_webhook)
    }

    /// The update URL, but only when auto-update is switched on.
    pub fn auto_update_url(&self) -> Option<&str> {
        if !self.auto_update {
            return None;
        }
        non_blank(&self.update_url)
    }

    /// Applies an edit coming from the presentation layer.
    ///
    /// Credential fields are write-only from the UI's point of view: an edit that
    /// omits them keeps what the auth flow stored, while an explicit blank clears it.
    pub fn merge_update(&mut self, incoming: ServerProfile) {
        let ServerProfile {
            id: _,
            name,
            path,
            jar_file,
            java_args,
            java_path,
            refresh_token,
            auth_session_token,
            auth_identity_token,
            auto_update,
            update_url,
            discord_webhook,
            hytale_api_key,
            extra_env,
            extra,
        } = incoming;

        self.name = name;
        self.path = path;
        self.jar_file = jar_file;
        self.java_args = java_args;
        self.java_path = java_path;
        self.auto_update = auto_update;
        self.update_url = update_url;
        self.discord_webhook = discord_webhook;
        self.extra_env = extra_env;
        merge_secret(&mut self.refresh_token, refresh_token);
        merge_secret(&mut self.auth_session_token, auth_session_token);
        merge_secret(&mut self.auth_identity_token, auth_identity_token);
        merge_secret(&mut self.hytale_api_key, hytale_api_key);
        for (key, value) in extra {
            self.extra.insert(key, value);
        }
    }

    pub fn clear_credentials(&mut self) {
        self.refresh_token = None;
        self.auth_session_token = None;
        self.auth_identity_token = None;
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SessionState {
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stopping)
    }
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RunningServer {
    pub profile_id: String,
    pub pid: Option<u32>,
    pub started_at: i64,
    pub state: SessionState,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Stdout,
    Stderr,
    Info,
    Warning,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerLogPayload {
    pub profile_id: String,
    pub log: String,
    pub level: ConsoleLevel,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatePayload {
    pub profile_id: String,
    pub is_running: bool,
}

/// Structured result of classifying a console line that asks for interactive login.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthPrompt {
    pub raw_line: String,
    pub code: Option<String>,
    pub url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthNeededPayload {
    pub profile_id: String,
    #[serde(flatten)]
    pub prompt: AuthPrompt,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    ServerLog(ServerLogPayload),
    ServerStateChange(ServerStatePayload),
    AuthNeeded(AuthNeededPayload),
}

impl ServerEvent {
    pub fn log(profile_id: &str, level: ConsoleLevel, log: impl Into<String>) -> Self {
        ServerEvent::ServerLog(ServerLogPayload {
            profile_id: profile_id.to_string(),
            log: log.into(),
            level,
        })
    }

    pub fn state(profile_id: &str, is_running: bool) -> Self {
        ServerEvent::ServerStateChange(ServerStatePayload {
            profile_id: profile_id.to_string(),
            is_running,
        })
    }

    pub fn auth_needed(profile_id: &str, prompt: AuthPrompt) -> Self {
        ServerEvent::AuthNeeded(AuthNeededPayload {
            profile_id: profile_id.to_string(),
            prompt,
        })
    }

    pub fn profile_id(&self) -> &str {
        match self {
            ServerEvent::ServerLog(payload) => &payload.profile_id,
            ServerEvent::ServerStateChange(payload) => &payload.profile_id,
            ServerEvent::AuthNeeded(payload) => &payload.profile_id,
        }
    }
}

/// Response of the OAuth device-authorization endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    #[serde(default = "default_device_expiry")]
    pub expires_in: u64,
    #[serde(default = "default_device_interval")]
    pub interval: u64,
}

fn default_device_expiry() -> u64 {
    600
}

fn default_device_interval() -> u64 {
    5
}

impl DeviceAuthorization {
    /// The URL a human should open; prefers the variant with the code pre-filled.
    pub fn browser_url(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&self.verification_uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_profile_keys_survive_a_round_trip() {
        let raw = r#"{
            "id": "srv-1",
            "name": "Main",
            "path": "/srv/hytale",
            "jarFile": "HytaleServer.jar",
            "javaArgs": "-Xmx4G",
            "whitelistEnabled": true
        }"#;
        let profile: ServerProfile = serde_json::from_str(raw).expect("parse profile");
        assert_eq!(profile.jar_file, "HytaleServer.jar");
        assert_eq!(profile.extra.get("whitelistEnabled"), Some(&Value::Bool(true)));

        let written = serde_json::to_value(&profile).expect("serialize profile");
        assert_eq!(written["whitelistEnabled"], Value::Bool(true));
        assert!(written.get("refreshToken").is_none());
    }

    #[test]
    fn blank_credentials_read_as_absent() {
        let profile = ServerProfile {
            refresh_token: Some("   ".to_string()),
            hytale_api_key: Some(String::new()),
            auto_update: true,
            update_url: Some("".to_string()),
            ..Default::default()
        };
        assert_eq!(profile.refresh_token(), None);
        assert_eq!(profile.api_key(), None);
        assert_eq!(profile.auto_update_url(), None);
    }

    #[test]
    fn merge_update_keeps_hidden_tokens() {
        let mut stored = ServerProfile {
            id: "srv-1".to_string(),
            name: "Old".to_string(),
            refresh_token: Some("refresh".to_string()),
            auth_session_token: Some("session".to_string()),
            ..Default::default()
        };
        let incoming = ServerProfile {
            id: "srv-ignored".to_string(),
            name: "New".to_string(),
            java_args: "-Xmx2G".to_string(),
            ..Default::default()
        };
        stored.merge_update(incoming);

        assert_eq!(stored.id, "srv-1");
        assert_eq!(stored.name, "New");
        assert_eq!(stored.java_args, "-Xmx2G");
        assert_eq!(stored.refresh_token(), Some("refresh"));
        assert_eq!(stored.session_token(), Some("session"));
    }

    #[test]
    fn merge_update_clears_credentials_sent_blank() {
        let mut stored = ServerProfile {
            id: "srv-1".to_string(),
            refresh_token: Some("refresh".to_string()),
            hytale_api_key: Some("secret".to_string()),
            ..Default::default()
        };
        let incoming: ServerProfile =
            serde_json::from_str(r#"{ "id": "srv-1", "hytaleApiKey": "", "refreshToken": "  " }"#)
                .expect("parse edit");
        stored.merge_update(incoming);

        assert_eq!(stored.hytale_api_key, None);
        assert_eq!(stored.refresh_token, None);

        stored.merge_update(ServerProfile {
            hytale_api_key: Some("replacement".to_string()),
            ..Default::default()
        });
        assert_eq!(stored.api_key(), Some("replacement"));
    }

    #[test]
    fn events_serialize_with_presentation_names() {
        let event = ServerEvent::state("srv-1", true);
        let value = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(value["event"], "server-state-change");
        assert_eq!(value["profileId"], "srv-1");
        assert_eq!(value["isRunning"], true);

        let prompt = AuthPrompt {
            raw_line: "visit https://example/device/verify".to_string(),
            code: Some("ABCD-EFGH".to_string()),
            url: None,
        };
        let value = serde_json::to_value(ServerEvent::auth_needed("srv-1", prompt))
            .expect("serialize auth event");
        assert_eq!(value["event"], "auth-needed");
        assert_eq!(value["code"], "ABCD-EFGH");
    }
}
