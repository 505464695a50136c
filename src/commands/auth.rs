use std::time::{Duration, Instant};

use crate::models::{AuthPrompt, ConsoleLevel, ServerEvent, ServerProfile};
use crate::services::auth_service::DevicePoll;
use crate::AppState;

const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Interactive login for a profile: shows a device code, waits for the user
/// to approve it, stores the refresh token and fills in session tokens.
pub async fn login_with_device_flow(id: String, state: &AppState) -> Result<ServerProfile, String> {
    state
        .profiles
        .require(&id)
        .await
        .map_err(|err| err.to_string())?;

    let auth = state.controller.auth_client();
    let device = auth
        .start_device_authorization()
        .await
        .map_err(|err| err.to_string())?;

    let url = device.browser_url().to_string();
    state.events.emit(ServerEvent::auth_needed(
        &id,
        AuthPrompt {
            raw_line: format!("Open {} and enter code {}", url, device.user_code),
            code: Some(device.user_code.clone()),
            url: Some(url),
        },
    ));

    let deadline = Instant::now() + Duration::from_secs(device.expires_in);
    let mut interval = Duration::from_secs(device.interval);
    let grant = loop {
        if Instant::now() >= deadline {
            return Err("device code expired before login completed".to_string());
        }
        tokio::time::sleep(interval).await;
        match auth
            .poll_device_token(&device.device_code)
            .await
            .map_err(|err| err.to_string())?
        {
            DevicePoll::Granted(grant) => break grant,
            DevicePoll::Pending => {}
            DevicePoll::SlowDown => interval += SLOW_DOWN_STEP,
        }
    };

    let refresh_token = grant
        .refresh_token
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| "login completed without a refresh token".to_string())?;
    let stored = state
        .profiles
        .modify(&id, |profile| profile.refresh_token = Some(refresh_token))
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("server config not found for ID {id}"))?;
    state
        .events
        .console(&id, ConsoleLevel::Info, "[Auth] Login complete. Auto-refresh enabled.");

    match state.controller.refresh_session(&stored).await {
        Ok(refreshed) => Ok(refreshed),
        Err(err) => {
            state.events.console(
                &id,
                ConsoleLevel::Warning,
                format!("[Auth Warning] Session refresh failed: {err}"),
            );
            Ok(stored)
        }
    }
}

pub async fn refresh_session(id: String, state: &AppState) -> Result<ServerProfile, String> {
    let profile = state
        .profiles
        .require(&id)
        .await
        .map_err(|err| err.to_string())?;
    state
        .controller
        .refresh_session(&profile)
        .await
        .map_err(|err| err.to_string())
}

/// Forgets every stored credential for the profile.
pub async fn logout(id: String, state: &AppState) -> Result<(), String> {
    state
        .profiles
        .modify(&id, ServerProfile::clear_credentials)
        .await
        .map_err(|err| err.to_string())?
        .map(|_| ())
        .ok_or_else(|| format!("server config not found for ID {id}"))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::errors::{ManagerError, Result};
    use crate::models::DeviceAuthorization;
    use crate::services::auth_service::{AccessGrant, AuthClient, SessionTokens};
    use crate::services::update_service::testing::StaticFetcher;
    use crate::services::MemoryProfileStore;
    use crate::settings::ManagerSettings;

    struct DeviceScript {
        polls: Mutex<Vec<DevicePoll>>,
    }

    #[async_trait]
    impl AuthClient for DeviceScript {
        async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<AccessGrant> {
            assert_eq!(refresh_token, "device-refresh");
            Ok(AccessGrant {
                access_token: "access".to_string(),
                refresh_token: None,
            })
        }

        async fn fetch_owner_id(&self, _access_token: &str) -> Result<String> {
            Ok("owner".to_string())
        }

        async fn create_session(&self, _access_token: &str, _owner_id: &str) -> Result<SessionTokens> {
            Ok(SessionTokens {
                session_token: "session".to_string(),
                identity_token: None,
            })
        }

        async fn start_device_authorization(&self) -> Result<DeviceAuthorization> {
            Ok(DeviceAuthorization {
                device_code: "device".to_string(),
                user_code: "WXYZ-1234".to_string(),
                verification_uri: "https://login.example/device/verify".to_string(),
                verification_uri_complete: None,
                expires_in: 60,
                interval: 0,
            })
        }

        async fn poll_device_token(&self, _device_code: &str) -> Result<DevicePoll> {
            let mut polls = self.polls.lock().unwrap();
            if polls.is_empty() {
                return Err(ManagerError::Auth("poll script exhausted".to_string()));
            }
            Ok(polls.remove(0))
        }
    }

    #[tokio::test]
    async fn device_login_stores_token_and_session() {
        let script = DeviceScript {
            polls: Mutex::new(vec![
                DevicePoll::Pending,
                DevicePoll::Granted(AccessGrant {
                    access_token: "device-access".to_string(),
                    refresh_token: Some("device-refresh".to_string()),
                }),
            ]),
        };
        let state = AppState::from_parts(
            ManagerSettings::with_root(
                std::env::temp_dir().join(format!("hytale-manager-login-{}", Uuid::new_v4())),
            ),
            reqwest::Client::new(),
            Arc::new(MemoryProfileStore::default()),
            Arc::new(script),
            Arc::new(StaticFetcher::writing(b"")),
        );
        let mut rx = state.events.subscribe();
        let added = state
            .profiles
            .add(ServerProfile {
                path: "/srv/main".to_string(),
                ..Default::default()
            })
            .await
            .expect("add");

        let profile = login_with_device_flow(added.id.clone(), &state)
            .await
            .expect("login");
        assert_eq!(profile.refresh_token(), Some("device-refresh"));
        assert_eq!(profile.session_token(), Some("session"));

        match rx.recv().await {
            Some(ServerEvent::AuthNeeded(payload)) => {
                assert_eq!(payload.prompt.code.as_deref(), Some("WXYZ-1234"));
            }
            other => panic!("expected auth-needed first, got {other:?}"),
        }

        logout(added.id.clone(), &state).await.expect("logout");
        let cleared = state.profiles.require(&added.id).await.expect("require");
        assert_eq!(cleared.refresh_token(), None);
        assert_eq!(cleared.session_token(), None);
    }
}
