use thiserror::Error;

/// Failure reported by an external collaborator (embedder, scorer, segmenter, renderer).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error("bad response from {collaborator}: {details}")]
    BadResponse {
        collaborator: String,
        details: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("window selection failed: every band of page {page} failed to score")]
    WindowSelection { page: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf error: {0}")]
    Pdf(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("unit of work timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl IngestError {
    /// Whether a fresh attempt on the same input can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            IngestError::ProtocolViolation(_) | IngestError::Validation(_)
        )
    }
}

impl From<lopdf::Error> for IngestError {
    fn from(error: lopdf::Error) -> Self {
        IngestError::Pdf(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search request: {0}")]
    Validation(String),

    #[error("collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("search timed out after {0:?}")]
    Timeout(std::time::Duration),
}
