use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::hash::content_path;

/// Durable home for uploaded payload files.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persists `data` and returns where it now lives.
    async fn store(&self, hash_hex: &str, ext: &str, data: &[u8]) -> std::io::Result<PathBuf>;

    async fn retrieve(&self, path: &Path) -> std::io::Result<Vec<u8>>;
}

#[async_trait]
impl<T: FileStore + ?Sized> FileStore for Box<T> {
    async fn store(&self, hash_hex: &str, ext: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        (**self).store(hash_hex, ext, data).await
    }

    async fn retrieve(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        (**self).retrieve(path).await
    }
}

/// Content-addressed store on the local filesystem.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn store(&self, hash_hex: &str, ext: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let dest = content_path(&self.root, hash_hex, ext);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Same hash means same bytes; an existing file is already correct.
        if tokio::fs::try_exists(&dest).await? {
            return Ok(dest);
        }
        tokio::fs::write(&dest, data).await?;
        Ok(dest)
    }

    async fn retrieve(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }
}
