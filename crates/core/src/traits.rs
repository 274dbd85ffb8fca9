use crate::error::{CollaboratorError, IngestError, SearchError};
use crate::language::TextSearchLanguage;
use crate::models::{BranchRankings, NewUpload, PersistedUpload, QueueEntry, SearchFilters};
use crate::segment::{ConversationState, PageBatch, SegmenterReply};
use async_trait::async_trait;
use image::DynamicImage;

/// Maps text, or an image with text, into one shared vector space.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;

    async fn embed_image_text(
        &self,
        image: &DynamicImage,
        text: &str,
    ) -> Result<Vec<f32>, CollaboratorError>;
}

/// Scores how relevant an image is to a text, in `[0, 1]`.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score_relevance(&self, text: &str, image: &DynamicImage)
        -> Result<f32, CollaboratorError>;
}

/// Loads and unloads an expensive model held through [`crate::lease::ScopedModel`].
#[async_trait]
pub trait ModelLoader: Send + Sync + 'static {
    type Model: Send + Sync + 'static;

    async fn load(&self) -> Result<Self::Model, CollaboratorError>;

    fn unload(&self, model: Self::Model);
}

/// Multi-turn page segmentation; the caller threads the conversation state.
#[async_trait]
pub trait DocumentSegmenter: Send + Sync {
    async fn segment(
        &self,
        batch: &PageBatch<'_>,
        state: &ConversationState,
    ) -> Result<SegmenterReply, CollaboratorError>;
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render_page(
        &self,
        document: &[u8],
        page_number: u32,
        dpi: u32,
    ) -> Result<DynamicImage, CollaboratorError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> std::io::Result<()>;

    async fn get(&self, key: &str) -> std::io::Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> std::io::Result<()>;
}

/// Why a unit of work gave up its claim.
#[derive(Debug, Clone)]
pub struct Failure {
    pub message: String,
    pub retryable: bool,
    pub max_attempts: u32,
}

impl Failure {
    pub fn from_error(error: &IngestError, max_attempts: u32) -> Self {
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
            max_attempts,
        }
    }

    pub fn quarantines(&self, attempts: u32) -> bool {
        !self.retryable || attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub attempts: u32,
    pub quarantined: bool,
}

/// Exclusive ownership of one queue entry for one processing attempt.
///
/// Dropping a claim without committing or releasing gives the entry back untouched.
#[async_trait]
pub trait QueueClaim: Send {
    fn entry(&self) -> &QueueEntry;

    /// Writes the file and its chunks and removes the entry, atomically. Returns the file id.
    async fn commit(&mut self, upload: PersistedUpload) -> Result<i64, IngestError>;

    /// Discards the unit of work and records the failed attempt.
    async fn release(self, failure: &Failure) -> Result<ReleaseOutcome, IngestError>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    type Claim: QueueClaim;

    async fn enqueue(&self, upload: NewUpload) -> Result<i64, IngestError>;

    /// Entries that are neither quarantined nor finished.
    async fn pending_count(&self) -> Result<u64, IngestError>;

    /// Claims the oldest eligible entry, skipping rows locked by other claimers.
    async fn claim_next(&self, exclude: &[i64]) -> Result<Option<Self::Claim>, IngestError>;

    /// Clears the quarantine flag so the entry is claimable again.
    async fn requeue_failed(&self, uploading_id: i64) -> Result<bool, IngestError>;
}

/// Inputs of the two retrieval branches for one request.
#[derive(Debug, Clone)]
pub struct RankingRequest<'a> {
    pub query_text: &'a str,
    /// `None` skips the semantic branch.
    pub query_vector: Option<&'a [f32]>,
    pub language: TextSearchLanguage,
    pub filters: &'a SearchFilters,
    pub semantic_limit: usize,
    pub keyword_limit: usize,
}

#[async_trait]
pub trait ChunkIndex: Send + Sync {
    async fn rank_candidates(
        &self,
        request: &RankingRequest<'_>,
    ) -> Result<BranchRankings, SearchError>;
}
