use std::path::PathBuf;

use crate::models::{RunningServer, ServerProfile};
use crate::services::{BackupEntry, BackupReport, StartOutcome};
use crate::AppState;

pub async fn get_servers(state: &AppState) -> Result<Vec<ServerProfile>, String> {
    state.profiles.list().await.map_err(|err| err.to_string())
}

pub async fn add_server(server: ServerProfile, state: &AppState) -> Result<ServerProfile, String> {
    if server.path.trim().is_empty() {
        return Err("server path is required".to_string());
    }
    state.profiles.add(server).await.map_err(|err| err.to_string())
}

pub async fn update_server(server: ServerProfile, state: &AppState) -> Result<ServerProfile, String> {
    let id = server.id.clone();
    state
        .profiles
        .update(server)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("server config not found for ID {id}"))
}

/// Removes a profile, and its directory when `delete_files` is set.
/// Running servers have to be stopped first.
pub async fn delete_server(id: String, delete_files: bool, state: &AppState) -> Result<bool, String> {
    if state.controller.is_active(&id) {
        return Err("server is running; stop it before deleting".to_string());
    }
    let Some(removed) = state.profiles.delete(&id).await.map_err(|err| err.to_string())? else {
        return Ok(false);
    };

    if delete_files && !removed.path.trim().is_empty() {
        let dir = PathBuf::from(&removed.path);
        if dir.is_dir() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|err| format!("profile removed but files were not: {err}"))?;
            tracing::info!("deleted server files at {}", dir.display());
        }
    }
    Ok(true)
}

pub async fn start_server(id: String, state: &AppState) -> Result<StartOutcome, String> {
    Ok(state.controller.start(&id).await)
}

pub async fn stop_server(id: String, state: &AppState) -> Result<bool, String> {
    Ok(state.controller.stop(&id).await)
}

pub async fn send_command(id: String, command: String, state: &AppState) -> Result<bool, String> {
    Ok(state.controller.send_command(&id, &command).await)
}

pub fn server_status(state: &AppState) -> Result<Vec<RunningServer>, String> {
    Ok(state.controller.running())
}

pub async fn backup_server(id: String, state: &AppState) -> Result<BackupReport, String> {
    let profile = state
        .profiles
        .require(&id)
        .await
        .map_err(|err| err.to_string())?;
    state
        .backups
        .backup_server(&profile)
        .await
        .map_err(|err| err.to_string())
}

pub fn list_backups(id: String, state: &AppState) -> Result<Vec<BackupEntry>, String> {
    state.backups.list_backups(&id).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::services::auth_service::testing::ScriptedAuth;
    use crate::services::update_service::testing::StaticFetcher;
    use crate::services::MemoryProfileStore;
    use crate::settings::ManagerSettings;
    use uuid::Uuid;

    fn state() -> AppState {
        let root = std::env::temp_dir().join(format!("hytale-manager-cmd-{}", Uuid::new_v4()));
        AppState::from_parts(
            ManagerSettings::with_root(root),
            reqwest::Client::new(),
            Arc::new(MemoryProfileStore::default()),
            Arc::new(ScriptedAuth::default()),
            Arc::new(StaticFetcher::writing(b"")),
        )
    }

    #[tokio::test]
    async fn update_keeps_tokens_the_editor_never_saw() {
        let state = state();
        let added = add_server(
            ServerProfile {
                name: "Main".to_string(),
                path: "/srv/main".to_string(),
                jar_file: "HytaleServer.jar".to_string(),
                refresh_token: Some("refresh".to_string()),
                ..Default::default()
            },
            &state,
        )
        .await
        .expect("add");

        let edited = ServerProfile {
            id: added.id.clone(),
            name: "Renamed".to_string(),
            path: added.path.clone(),
            jar_file: added.jar_file.clone(),
            ..Default::default()
        };
        let updated = update_server(edited, &state).await.expect("update");
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.refresh_token(), Some("refresh"));

        let missing = ServerProfile {
            id: "srv-missing".to_string(),
            ..Default::default()
        };
        assert!(update_server(missing, &state).await.is_err());
    }

    #[tokio::test]
    async fn delete_can_remove_server_files() {
        let state = state();
        let dir = std::env::temp_dir().join(format!("hytale-manager-delete-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create dir");
        std::fs::write(dir.join("config.json"), b"{}").expect("write file");

        let added = add_server(
            ServerProfile {
                path: dir.to_string_lossy().into_owned(),
                jar_file: "HytaleServer.jar".to_string(),
                ..Default::default()
            },
            &state,
        )
        .await
        .expect("add");

        assert!(delete_server(added.id.clone(), true, &state).await.expect("delete"));
        assert!(!dir.exists());
        assert!(!delete_server(added.id, true, &state).await.expect("second delete"));
        assert!(get_servers(&state).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn add_requires_a_path() {
        let state = state();
        assert!(add_server(ServerProfile::default(), &state).await.is_err());
    }
}
