use crate::traits::BlobStore;
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

// Keys carry the uploading id so an attempt only ever overwrites or deletes its own blobs.
pub fn raw_file_key(vetrina_id: i64, uploading_id: i64, sha256: &str, extension: &str) -> String {
    format!(
        "files/{vetrina_id}/{uploading_id}/{sha256}.{}",
        extension.to_ascii_lowercase()
    )
}

pub fn redacted_file_key(vetrina_id: i64, uploading_id: i64, sha256: &str) -> String {
    format!("redacted/{vetrina_id}/{uploading_id}/{sha256}.pdf")
}

pub fn crop_key(
    vetrina_id: i64,
    uploading_id: i64,
    sha256: &str,
    page_number: u32,
    chunk_id: u32,
) -> String {
    format!("crops/{vetrina_id}/{uploading_id}/{sha256}/p{page_number:04}-c{chunk_id:04}.png")
}

/// Blob storage rooted at a local directory.
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

    fn resolve(&self, key: &str) -> io::Result<PathBuf> {
        let relative = Path::new(key);
        let well_formed = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !well_formed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob key {key:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&staging, bytes).await?;
        if let Err(error) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(error);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.resolve(key)?).await
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.resolve(key)?).await {
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
