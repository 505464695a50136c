use std::path::{Path, PathBuf};

use crate::utils::file::write_atomic;
use crate::utils::paths::resolve_inside;
use crate::AppState;

pub const AOT_CACHE_FILE: &str = "HytaleServer.aot";

async fn server_file(id: &str, filename: &str, state: &AppState) -> Result<PathBuf, String> {
    let profile = state
        .profiles
        .require(id)
        .await
        .map_err(|err| err.to_string())?;
    resolve_inside(Path::new(&profile.path), filename).map_err(|err| err.to_string())
}

/// Reads a text file (config, whitelist, bans, ...) from the server directory.
pub async fn read_server_file(id: String, filename: String, state: &AppState) -> Result<String, String> {
    let path = server_file(&id, &filename, state).await?;
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|err| format!("failed to read {}: {err}", path.display()))
}

pub async fn save_server_file(
    id: String,
    filename: String,
    content: String,
    state: &AppState,
) -> Result<(), String> {
    let path = server_file(&id, &filename, state).await?;
    write_atomic(&path, content.as_bytes())
        .await
        .map_err(|err| format!("failed to write {}: {err}", path.display()))
}

pub async fn check_jar_exists(id: String, state: &AppState) -> Result<bool, String> {
    let profile = state
        .profiles
        .require(&id)
        .await
        .map_err(|err| err.to_string())?;
    if profile.jar_file.trim().is_empty() {
        return Ok(false);
    }
    Ok(Path::new(&profile.path).join(&profile.jar_file).is_file())
}

pub async fn check_aot_file(id: String, state: &AppState) -> Result<bool, String> {
    let path = server_file(&id, AOT_CACHE_FILE, state).await?;
    Ok(path.is_file())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::ServerProfile;
    use crate::services::auth_service::testing::ScriptedAuth;
    use crate::services::update_service::testing::StaticFetcher;
    use crate::services::MemoryProfileStore;
    use crate::settings::ManagerSettings;
    use uuid::Uuid;

    async fn state_with_server() -> (AppState, String, PathBuf) {
        let dir = std::env::temp_dir().join(format!("hytale-manager-files-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create server dir");
        let state = AppState::from_parts(
            ManagerSettings::with_root(dir.join("manager")),
            reqwest::Client::new(),
            Arc::new(MemoryProfileStore::default()),
            Arc::new(ScriptedAuth::default()),
            Arc::new(StaticFetcher::writing(b"")),
        );
        let added = state
            .profiles
            .add(ServerProfile {
                path: dir.to_string_lossy().into_owned(),
                jar_file: "HytaleServer.jar".to_string(),
                ..Default::default()
            })
            .await
            .expect("add");
        (state, added.id, dir)
    }

    #[tokio::test]
    async fn files_round_trip_inside_the_server_directory() {
        let (state, id, dir) = state_with_server().await;

        save_server_file(id.clone(), "whitelist.json".to_string(), "[]".to_string(), &state)
            .await
            .expect("save");
        assert_eq!(std::fs::read_to_string(dir.join("whitelist.json")).expect("on disk"), "[]");
        assert_eq!(
            read_server_file(id.clone(), "whitelist.json".to_string(), &state)
                .await
                .expect("read"),
            "[]"
        );

        assert!(read_server_file(id.clone(), "../outside.json".to_string(), &state)
            .await
            .is_err());
        assert!(save_server_file(id, "/etc/passwd".to_string(), String::new(), &state)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn jar_and_aot_checks_look_at_disk() {
        let (state, id, dir) = state_with_server().await;
        assert!(!check_jar_exists(id.clone(), &state).await.expect("jar check"));
        assert!(!check_aot_file(id.clone(), &state).await.expect("aot check"));

        std::fs::write(dir.join("HytaleServer.jar"), b"").expect("write jar");
        std::fs::write(dir.join(AOT_CACHE_FILE), b"").expect("write aot");
        assert!(check_jar_exists(id.clone(), &state).await.expect("jar check"));
        assert!(check_aot_file(id, &state).await.expect("aot check"));
    }
}
