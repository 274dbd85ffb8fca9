use crate::error::IngestError;
use crate::models::NewUpload;
use crate::traits::QueueStore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

/// Validates and enqueues an upload, returning its `uploading_id`.
pub async fn enqueue_upload<Q>(queue: &Q, upload: NewUpload) -> Result<i64, IngestError>
where
    Q: QueueStore + ?Sized,
{
    upload.validate()?;
    let size_bytes = upload.raw_bytes.len();
    let display_name = upload.display_name.clone();
    let uploading_id = queue.enqueue(upload).await?;
    info!(uploading_id, %display_name, size_bytes, "upload enqueued");
    Ok(uploading_id)
}

/// Uploads still waiting for a worker; quarantined entries are not counted.
pub async fn pending_count<Q>(queue: &Q) -> Result<u64, IngestError>
where
    Q: QueueStore + ?Sized,
{
    queue.pending_count().await
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Reads a file from disk into an upload for `vetrina_id`, named after the file stem.
pub async fn upload_from_path(
    path: &Path,
    requester_id: i64,
    vetrina_id: i64,
    tag: Option<String>,
) -> Result<NewUpload, IngestError> {
    let display_name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| {
            IngestError::Validation(format!("path missing filename: {}", path.display()))
        })?
        .to_string();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let raw_bytes = tokio::fs::read(path).await?;

    Ok(NewUpload {
        requester_id,
        vetrina_id,
        raw_bytes,
        display_name,
        extension,
        tag,
    })
}
