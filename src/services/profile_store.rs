use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::{ManagerError, Result};
use crate::models::ServerProfile;
use crate::utils::file::write_atomic;

/// Persistence of the ordered profile collection.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<ServerProfile>>;
    async fn save_all(&self, profiles: &[ServerProfile]) -> Result<()>;
}

/// `servers.json`: a pretty-printed JSON array of profiles.
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Creates `[]` only if nothing is there yet. Never replaces a file a
    /// concurrent writer got in first.
    async fn create_if_missing(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;
        match created {
            Ok(mut file) => {
                file.write_all(b"[]\n").await?;
                file.flush().await?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ProfileStore for JsonProfileStore {
    async fn list_all(&self) -> Result<Vec<ServerProfile>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            self.create_if_missing().await?;
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    async fn save_all(&self, profiles: &[ServerProfile]) -> Result<()> {
        let payload = serde_json::to_vec_pretty(profiles)?;
        write_atomic(&self.path, &payload).await?;
        Ok(())
    }
}

/// In-process store, for embedding and tests.
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: std::sync::Mutex<Vec<ServerProfile>>,
}

impl MemoryProfileStore {
    pub fn new(profiles: Vec<ServerProfile>) -> Self {
        Self {
            profiles: std::sync::Mutex::new(profiles),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ServerProfile>> {
        match self.profiles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn list_all(&self) -> Result<Vec<ServerProfile>> {
        Ok(self.lock().clone())
    }

    async fn save_all(&self, profiles: &[ServerProfile]) -> Result<()> {
        *self.lock() = profiles.to_vec();
        Ok(())
    }
}

/// Profile CRUD on top of a [`ProfileStore`].
///
/// Every mutation re-reads the collection, edits the record by id and writes
/// the whole collection back while holding `write_lock`, so an auth refresh
/// and a manual edit never overwrite each other with stale copies.
#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn ProfileStore>,
    write_lock: Arc<Mutex<()>>,
}

impl ProfileService {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn list(&self) -> Result<Vec<ServerProfile>> {
        self.store.list_all().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ServerProfile>> {
        let profiles = self.store.list_all().await?;
        Ok(profiles.into_iter().find(|profile| profile.id == id))
    }

    pub async fn require(&self, id: &str) -> Result<ServerProfile> {
        self.get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(format!("server config not found for ID {id}")))
    }

    pub async fn add(&self, mut profile: ServerProfile) -> Result<ServerProfile> {
        let _guard = self.write_lock.lock().await;
        let mut profiles = self.store.list_all().await?;
        profile.id = next_profile_id(&profiles);
        profiles.push(profile.clone());
        self.store.save_all(&profiles).await?;
        tracing::info!("added server profile {} ({})", profile.id, profile.name);
        Ok(profile)
    }

    /// Merges an edited profile into the stored record; `None` if the id is unknown.
    pub async fn update(&self, incoming: ServerProfile) -> Result<Option<ServerProfile>> {
        let id = incoming.id.clone();
        self.modify(&id, move |stored| stored.merge_update(incoming))
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<Option<ServerProfile>> {
        let _guard = self.write_lock.lock().await;
        let mut profiles = self.store.list_all().await?;
        let Some(index) = profiles.iter().position(|profile| profile.id == id) else {
            return Ok(None);
        };
        let removed = profiles.remove(index);
        self.store.save_all(&profiles).await?;
        tracing::info!("deleted server profile {}", id);
        Ok(Some(removed))
    }

    /// Re-reads the collection, applies `edit` to the record with `id` and
    /// persists the result. Returns the stored record after the edit.
    pub async fn modify<F>(&self, id: &str, edit: F) -> Result<Option<ServerProfile>>
    where
        F: FnOnce(&mut ServerProfile) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut profiles = self.store.list_all().await?;
        let Some(stored) = profiles.iter_mut().find(|profile| profile.id == id) else {
            return Ok(None);
        };
        edit(stored);
        let updated = stored.clone();
        self.store.save_all(&profiles).await?;
        Ok(Some(updated))
    }
}

fn next_profile_id(existing: &[ServerProfile]) -> String {
    let base = format!("srv-{}", Utc::now().timestamp_millis());
    let taken = |candidate: &str| existing.iter().any(|profile| profile.id == candidate);
    if !taken(&base) {
        return base;
    }
    let mut suffix = 1u32;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}
