use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;

use crate::errors::{ManagerError, Result};
use crate::models::ServerProfile;
use crate::utils::file::{copy_dir, dir_size};

const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupReport {
    pub path: PathBuf,
    pub files: u64,
    pub bytes: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Clone, Debug)]
pub struct BackupService {
    root: PathBuf,
}

impl BackupService {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn backup_dir(&self, profile_id: &str) -> PathBuf {
        self.root.join(profile_id)
    }

    /// Copies the whole server directory into a timestamped snapshot folder.
    pub async fn backup_server(&self, profile: &ServerProfile) -> Result<BackupReport> {
        let source = PathBuf::from(&profile.path);
        if profile.path.trim().is_empty() || !source.is_dir() {
            return Err(ManagerError::NotFound(format!(
                "server directory {} does not exist",
                profile.path
            )));
        }

        let target = unique_target(&self.backup_dir(&profile.id));
        let exclude = self.root.clone();
        let dest = target.clone();
        let stats = tokio::task::spawn_blocking(move || copy_dir(&source, &dest, Some(&exclude)))
            .await
            .map_err(|err| ManagerError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))??;

        tracing::info!(
            "backed up {} ({} files, {} bytes) to {}",
            profile.id,
            stats.files,
            stats.bytes,
            target.display()
        );
        Ok(BackupReport {
            path: target,
            files: stats.files,
            bytes: stats.bytes,
        })
    }

    /// Snapshot folders for `profile_id`, newest first.
    pub fn list_backups(&self, profile_id: &str) -> Result<Vec<BackupEntry>> {
        let dir = self.backup_dir(profile_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            entries.push(BackupEntry {
                name: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                bytes: dir_size(&path)?,
                path,
            });
        }
        entries.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(entries)
    }
}

fn unique_target(base: &Path) -> PathBuf {
    let stamp = Local::now().format(STAMP_FORMAT).to_string();
    let candidate = base.join(&stamp);
    if !candidate.exists() {
        return candidate;
    }
    let mut suffix = 1u32;
    loop {
        let candidate = base.join(format!("{stamp}-{suffix}"));
        if !candidate.exists() {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn backup_copies_tree_and_skips_nested_backup_root() {
        let server = std::env::temp_dir().join(format!("hytale-manager-backup-{}", Uuid::new_v4()));
        std::fs::create_dir_all(server.join("universe/worlds")).expect("create tree");
        std::fs::write(server.join("config.json"), b"{}").expect("write config");
        std::fs::write(server.join("universe/worlds/main.bin"), b"world").expect("write world");

        let service = BackupService::new(server.join("backups"));
        let profile = ServerProfile {
            id: "srv-1".to_string(),
            path: server.to_string_lossy().into_owned(),
            ..Default::default()
        };

        let first = service.backup_server(&profile).await.expect("first backup");
        assert_eq!(first.files, 2);
        assert_eq!(first.bytes, 7);
        assert!(first.path.join("universe/worlds/main.bin").is_file());

        let second = service.backup_server(&profile).await.expect("second backup");
        assert_eq!(second.files, 2);
        assert_ne!(first.path, second.path);
        let listed = service.list_backups("srv-1").expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|entry| entry.bytes == 7));
    }

    #[tokio::test]
    async fn missing_server_directory_is_reported() {
        let service = BackupService::new(std::env::temp_dir().join("hytale-manager-unused"));
        let profile = ServerProfile {
            id: "srv-1".to_string(),
            path: "/definitely/not/a/server".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            service.backup_server(&profile).await,
            Err(ManagerError::NotFound(_))
        ));
    }
}
