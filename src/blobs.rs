//! Filesystem [`BlobStore`]: `<root>/<user>/<task_id>.task.json` and
//! `<root>/<user>/<task_id>.result.json`.
//!
//! Writes go to a temporary sibling and are renamed into place, so a
//! reader never observes a half-written payload.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use skyquery_core::store::{BlobKey, BlobStore};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.root.join(&key.user).join(key.file_name())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &BlobKey, bytes: &[u8]) -> Result<String> {
        let dir = self.root.join(&key.user);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating blob directory {}", dir.display()))?;

        let path = self.path_for(key);
        let tmp = dir.join(format!(".{}.{}.tmp", key.file_name(), Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err).with_context(|| format!("moving blob into {}", path.display()));
        }
        tracing::debug!(blob = %key, path = %path.display(), "blob written");
        Ok(path.display().to_string())
    }

    async fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}
