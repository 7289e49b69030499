use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_core::ports::FileStorage;

/// Attachment files on local disk.
///
/// A file lives at `{root}/{site_id}/{provider_key}/{path}`. Paths must be
/// relative and may not climb out of their provider directory.
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub async fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        info!("File storage directory: {}", root.display());
        Ok(Self { root })
    }

    /// Resolves the on-disk location of a stored file.
    pub fn file_path(&self, site_id: Uuid, provider_key: &str, path: &str) -> Result<PathBuf> {
        let mut full = self.root.join(site_id.to_string());
        for part in [provider_key, path] {
            let relative = Path::new(part);
            if part.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
                bail!("Invalid storage path: {}", part);
            }
            full.push(relative);
        }
        Ok(full)
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn save_file(&self, site_id: Uuid, provider_key: &str, path: &str, data: &[u8]) -> Result<()> {
        let full = self.file_path(site_id, provider_key, path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, data).await?;
        debug!("Stored {} bytes at {}", data.len(), full.display());
        Ok(())
    }

    async fn get_file(&self, site_id: Uuid, provider_key: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.file_path(site_id, provider_key, path)?;
        match fs::read(&full).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, site_id: Uuid, provider_key: &str, path: &str) -> Result<()> {
        let full = self.file_path(site_id, provider_key, path)?;
        match fs::remove_file(&full).await {
            Ok(()) => {
                info!("Deleted file {}", full.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("File {} already gone", full.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
