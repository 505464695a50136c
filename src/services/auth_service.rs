use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{ManagerError, Result};
use crate::models::{DeviceAuthorization, ServerProfile};
use crate::settings::AuthEndpoints;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Short-lived OAuth access token, plus the rotated refresh token if the
/// server issued one.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionTokens {
    pub session_token: String,
    pub identity_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DevicePoll {
    Granted(AccessGrant),
    Pending,
    SlowDown,
}

/// Outcome of a full refresh: what has to be written back onto the profile.
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshedSession {
    pub rotated_refresh_token: Option<String>,
    pub owner_id: String,
    pub session: SessionTokens,
}

impl RefreshedSession {
    pub fn apply_to(&self, profile: &mut ServerProfile) {
        if let Some(rotated) = &self.rotated_refresh_token {
            profile.refresh_token = Some(rotated.clone());
        }
        profile.auth_session_token = Some(self.session.session_token.clone());
        profile.auth_identity_token = self.session.identity_token.clone();
    }
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<AccessGrant>;
    async fn fetch_owner_id(&self, access_token: &str) -> Result<String>;
    async fn create_session(&self, access_token: &str, owner_id: &str) -> Result<SessionTokens>;
    async fn start_device_authorization(&self) -> Result<DeviceAuthorization>;
    async fn poll_device_token(&self, device_code: &str) -> Result<DevicePoll>;
}

/// Runs the three dependent calls: token exchange, owner lookup, session creation.
pub async fn refresh_session(
    client: &dyn AuthClient,
    refresh_token: &str,
) -> Result<RefreshedSession> {
    let grant = client.exchange_refresh_token(refresh_token).await?;
    let owner_id = client.fetch_owner_id(&grant.access_token).await?;
    let session = client.create_session(&grant.access_token, &owner_id).await?;

    let rotated_refresh_token = grant
        .refresh_token
        .filter(|token| !token.trim().is_empty() && token != refresh_token);

    Ok(RefreshedSession {
        rotated_refresh_token,
        owner_id,
        session,
    })
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl TokenResponse {
    fn failure_reason(&self, status: StatusCode) -> String {
        match (&self.error, &self.error_description) {
            (Some(error), Some(description)) => format!("{error} ({description})"),
            (Some(error), None) => error.clone(),
            _ => status.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_token: Option<String>,
    identity_token: Option<String>,
}

/// Pulls the account owner's id out of a profile-lookup response:
/// `owner`, falling back to the first listed profile's `uuid`.
pub fn parse_owner_id(body: &Value) -> Option<String> {
    let non_empty = |value: &Value| {
        value
            .as_str()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    body.get("owner").and_then(non_empty).or_else(|| {
        body.get("profiles")
            .and_then(|value| value.as_array())
            .and_then(|profiles| profiles.first())
            .and_then(|first| first.get("uuid"))
            .and_then(non_empty)
    })
}

#[derive(Clone)]
pub struct HttpAuthClient {
    client: reqwest::Client,
    endpoints: AuthEndpoints,
}

impl HttpAuthClient {
    pub fn new(client: reqwest::Client, endpoints: AuthEndpoints) -> Self {
        Self { client, endpoints }
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<(StatusCode, TokenResponse)> {
        let response = self
            .client
            .post(&self.endpoints.token_url)
            .form(form)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<TokenResponse>(&text).unwrap_or_default();
        Ok((status, body))
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<AccessGrant> {
        let (status, body) = self
            .post_token_form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.endpoints.client_id.as_str()),
                ("refresh_token", refresh_token),
            ])
            .await?;

        match body.access_token.as_deref().filter(|token| !token.is_empty()) {
            Some(access_token) if status.is_success() => Ok(AccessGrant {
                access_token: access_token.to_string(),
                refresh_token: body.refresh_token.clone(),
            }),
            _ => Err(ManagerError::Auth(format!(
                "OAuth refresh failed: {}",
                body.failure_reason(status)
            ))),
        }
    }

    async fn fetch_owner_id(&self, access_token: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.endpoints.profiles_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ManagerError::Auth(format!(
                "profile lookup failed: {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        parse_owner_id(&body).ok_or_else(|| ManagerError::Auth("no profile found".to_string()))
    }

    async fn create_session(&self, access_token: &str, owner_id: &str) -> Result<SessionTokens> {
        let response = self
            .client
            .post(&self.endpoints.session_url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "uuid": owner_id }))
            .send()
            .await?;
        let status = response.status();
        let body: SessionResponse = response.json().await.unwrap_or_default();

        match body.session_token.filter(|token| !token.is_empty()) {
            Some(session_token) if status.is_success() => Ok(SessionTokens {
                session_token,
                identity_token: body.identity_token.filter(|token| !token.is_empty()),
            }),
            _ => Err(ManagerError::Auth(format!(
                "session creation failed: {status}"
            ))),
        }
    }

    async fn start_device_authorization(&self) -> Result<DeviceAuthorization> {
        let response = self
            .client
            .post(&self.endpoints.device_url)
            .form(&[
                ("client_id", self.endpoints.client_id.as_str()),
                ("scope", self.endpoints.scope.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ManagerError::Http(format!(
                "device authorization failed ({}): {}",
                status.as_u16(),
                text
            )));
        }
        Ok(response.json().await?)
    }

    async fn poll_device_token(&self, device_code: &str) -> Result<DevicePoll> {
        let (status, body) = self
            .post_token_form(&[
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", self.endpoints.client_id.as_str()),
                ("device_code", device_code),
            ])
            .await?;

        if status.is_success() {
            if let Some(access_token) = body.access_token.clone().filter(|token| !token.is_empty()) {
                return Ok(DevicePoll::Granted(AccessGrant {
                    access_token,
                    refresh_token: body.refresh_token.clone(),
                }));
            }
        }

        match body.error.as_deref() {
            Some("authorization_pending") => Ok(DevicePoll::Pending),
            Some("slow_down") => Ok(DevicePoll::SlowDown),
            Some("expired_token") => Err(ManagerError::Auth(
                "device code expired before login completed".to_string(),
            )),
            Some("access_denied") => Err(ManagerError::Auth("login was denied".to_string())),
            _ => Err(ManagerError::Auth(format!(
                "device token poll failed: {}",
                body.failure_reason(status)
            ))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedAuth;
    use super::*;

    #[test]
    fn owner_id_prefers_owner_then_first_profile() {
        let direct = serde_json::json!({ "owner": "abc", "profiles": [{ "uuid": "def" }] });
        assert_eq!(parse_owner_id(&direct).as_deref(), Some("abc"));

        let listed = serde_json::json!({ "profiles": [{ "uuid": "def" }, { "uuid": "ghi" }] });
        assert_eq!(parse_owner_id(&listed).as_deref(), Some("def"));

        let empty = serde_json::json!({ "owner": "", "profiles": [] });
        assert_eq!(parse_owner_id(&empty), None);
    }

    #[tokio::test]
    async fn refresh_runs_all_three_steps_in_order() {
        let auth = ScriptedAuth::succeeding(Some("rotated"));
        let refreshed = refresh_session(&auth, "original").await.expect("refresh");

        assert_eq!(auth.calls(), vec!["exchange", "owner", "session"]);
        assert_eq!(refreshed.rotated_refresh_token.as_deref(), Some("rotated"));
        assert_eq!(refreshed.owner_id, "owner-uuid");
        assert_eq!(refreshed.session.session_token, "session-token");
    }

    #[tokio::test]
    async fn refresh_stops_at_the_first_failure() {
        let auth = ScriptedAuth::failing_exchange("invalid_grant");
        let err = refresh_session(&auth, "original").await.unwrap_err();

        assert!(err.to_string().contains("invalid_grant"));
        assert_eq!(auth.calls(), vec!["exchange"]);
    }

    #[test]
    fn apply_overwrites_refresh_token_only_on_rotation() {
        let session = SessionTokens {
            session_token: "s".to_string(),
            identity_token: Some("i".to_string()),
        };
        let mut profile = ServerProfile {
            refresh_token: Some("old".to_string()),
            ..Default::default()
        };

        RefreshedSession {
            rotated_refresh_token: None,
            owner_id: "o".to_string(),
            session: session.clone(),
        }
        .apply_to(&mut profile);
        assert_eq!(profile.refresh_token(), Some("old"));
        assert_eq!(profile.session_token(), Some("s"));

        RefreshedSession {
            rotated_refresh_token: Some("new".to_string()),
            owner_id: "o".to_string(),
            session,
        }
        .apply_to(&mut profile);
        assert_eq!(profile.refresh_token(), Some("new"));
        assert_eq!(profile.identity_token(), Some("i"));
    }
}
