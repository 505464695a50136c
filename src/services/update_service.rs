use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::errors::{ManagerError, Result};
use crate::utils::file::{sha256_file, sibling_with_suffix};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { bytes: u64 },
    Unchanged,
}

#[async_trait]
pub trait UpdateFetcher: Send + Sync {
    /// Makes `dest` match the binary served at `url`.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<UpdateOutcome>;
}

/// Streams `url` into `dest`, creating parent directories. Returns bytes written.
pub async fn download_to_path(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ManagerError::Http(format!(
            "download failed ({}) for {}",
            response.status().as_u16(),
            url
        )));
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(downloaded)
}

/// Downloads next to the target, then swaps it in only if the content differs.
///
/// The previous binary is kept as `<jar>.bak`; if the swap fails half way it
/// is moved back.
#[derive(Clone)]
pub struct HttpUpdateFetcher {
    client: reqwest::Client,
}

impl HttpUpdateFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

async fn digest(path: PathBuf) -> Result<String> {
    let hashed = tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|err| ManagerError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))??;
    Ok(hashed)
}

async fn swap_in(staged: &Path, dest: &Path, backup: &Path) -> Result<()> {
    let had_previous = tokio::fs::try_exists(dest).await.unwrap_or(false);
    if had_previous {
        tokio::fs::rename(dest, backup).await?;
    }
    if let Err(err) = tokio::fs::rename(staged, dest).await {
        if had_previous {
            if let Err(restore_err) = tokio::fs::rename(backup, dest).await {
                tracing::error!(
                    "failed to restore {} from backup: {}",
                    dest.display(),
                    restore_err
                );
            }
        }
        return Err(err.into());
    }
    Ok(())
}

#[async_trait]
impl UpdateFetcher for HttpUpdateFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<UpdateOutcome> {
        let staged = sibling_with_suffix(dest, "download");
        let bytes = match download_to_path(&self.client, url, &staged).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(err);
            }
        };

        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            let current = digest(dest.to_path_buf()).await?;
            let incoming = digest(staged.clone()).await?;
            if current == incoming {
                let _ = tokio::fs::remove_file(&staged).await;
                tracing::info!("{} is already up to date", dest.display());
                return Ok(UpdateOutcome::Unchanged);
            }
        }

        let backup = sibling_with_suffix(dest, "bak");
        if let Err(err) = swap_in(&staged, dest, &backup).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(err);
        }
        tracing::info!("updated {} ({} bytes) from {}", dest.display(), bytes, url);
        Ok(UpdateOutcome::Updated { bytes })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Writes fixed content on fetch, or fails with the given message.
    pub struct StaticFetcher {
        pub content: Option<Vec<u8>>,
        pub failure: Option<String>,
        pub fetched: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        pub fn writing(content: &[u8]) -> Self {
            Self {
                content: Some(content.to_vec()),
                failure: None,
                fetched: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                content: None,
                failure: Some(message.to_string()),
                fetched: Mutex::new(Vec::new()),
            }
        }

        pub fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpdateFetcher for StaticFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<UpdateOutcome> {
            self.fetched.lock().unwrap().push(url.to_string());
            if let Some(message) = &self.failure {
                return Err(ManagerError::Http(message.clone()));
            }
            let content = self.content.clone().unwrap_or_default();
            tokio::fs::write(dest, &content).await?;
            Ok(UpdateOutcome::Updated {
                bytes: content.len() as u64,
            })
        }
    }
}
