pub mod blob;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod language;
pub mod lease;
pub mod models;
pub mod queue;
pub mod redact;
pub mod remote;
pub mod retrieval;
pub mod segment;
pub mod stores;
pub mod traits;
pub mod window;

pub use blob::FsBlobStore;
pub use config::{
    ExtractionOptions, IngestionOptions, RedactionOptions, RetryPolicy, SearchOptions,
    WindowOptions, STANDARD_RENDER_DPI,
};
pub use embeddings::{HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{CollaboratorError, IngestError, SearchError};
pub use ingest::{Collaborators, DrainReport, IngestionWorker};
pub use language::{detect_language, resolve_language, TextSearchLanguage};
pub use lease::{ModelLease, ScopedModel};
pub use models::{
    ChunkDisplay, ChunkKey, ChunkRecord, ExtractedChunk, FileRecord, NewUpload, QueueEntry,
    SearchFilters, SearchQuery, SearchResponse, SearchResult,
};
pub use queue::{discover_pdf_files, enqueue_upload, pending_count, upload_from_path};
pub use redact::{page_count, Redactor};
pub use remote::{
    HttpEmbedder, HttpPageRenderer, HttpRelevanceScorer, HttpScorerLoader, HttpSegmenter,
    RemoteConfig,
};
pub use retrieval::{fuse, HybridSearchEngine};
pub use segment::{ChunkExtractor, ConversationState};
pub use stores::{MemoryStore, PgStore, VetrinaInfo};
pub use traits::{
    BlobStore, ChunkIndex, DocumentSegmenter, Embedder, ModelLoader, PageRenderer, QueueClaim,
    QueueStore, RelevanceScorer,
};
pub use window::{select_best_window, window_layout, WindowSelection};
