//! The queue worker: claim an upload, turn it into chunks with crops and embeddings,
//! redact it, and persist everything in one unit of work.

use crate::blob::{crop_key, raw_file_key, redacted_file_key};
use crate::config::IngestionOptions;
use crate::error::{CollaboratorError, IngestError};
use crate::lease::ScopedModel;
use crate::models::{
    ChunkRecord, ExtractedChunk, FileRecord, PersistedUpload, QueueEntry, SUPPORTED_EXTENSION,
};
use crate::queue::digest_bytes;
use crate::redact::{page_count, Redactor};
use crate::remote::encode_png;
use crate::segment::ChunkExtractor;
use crate::traits::{
    BlobStore, DocumentSegmenter, Embedder, Failure, ModelLoader, PageRenderer, QueueClaim,
    QueueStore, RelevanceScorer,
};
use crate::window::select_best_window;
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// External services a worker drives.
pub struct Collaborators<L: ModelLoader> {
    pub embedder: Arc<dyn Embedder>,
    pub scorer: ScopedModel<L>,
    pub segmenter: Arc<dyn DocumentSegmenter>,
    pub renderer: Arc<dyn PageRenderer>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// `(uploading_id, file_id)` of every upload that reached the index.
    pub persisted: Vec<(i64, i64)>,
    /// Released uploads that stay eligible for another attempt.
    pub retried: Vec<i64>,
    pub quarantined: Vec<i64>,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.persisted.len() + self.retried.len() + self.quarantined.len()
    }
}

pub struct IngestionWorker<Q, L>
where
    Q: QueueStore,
    L: ModelLoader,
{
    queue: Q,
    collaborators: Collaborators<L>,
    options: IngestionOptions,
    worker_id: Uuid,
}

impl<Q, L> IngestionWorker<Q, L>
where
    Q: QueueStore,
    L: ModelLoader,
    L::Model: RelevanceScorer,
{
    pub fn new(
        queue: Q,
        collaborators: Collaborators<L>,
        options: IngestionOptions,
    ) -> Result<Self, IngestError> {
        options.validate()?;
        Ok(Self {
            queue,
            collaborators,
            options,
            worker_id: Uuid::new_v4(),
        })
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Claims and processes uploads until none are left.
    ///
    /// Each upload is attempted at most once per pass, so a failing entry cannot spin the loop.
    pub async fn drain(&self) -> Result<DrainReport, IngestError> {
        let mut report = DrainReport::default();
        let mut attempted: Vec<i64> = Vec::new();

        loop {
            if let Some(limit) = self.options.max_entries_per_pass {
                if attempted.len() >= limit {
                    debug!(limit, "pass limit reached");
                    break;
                }
            }
            let Some(claim) = self.queue.claim_next(&attempted).await? else {
                break;
            };
            attempted.push(claim.entry().uploading_id);
            self.run_unit(claim, &mut report).await?;
        }

        info!(
            worker = %self.worker_id,
            persisted = report.persisted.len(),
            retried = report.retried.len(),
            quarantined = report.quarantined.len(),
            "queue drained"
        );
        Ok(report)
    }

    async fn run_unit(&self, mut claim: Q::Claim, report: &mut DrainReport) -> Result<(), IngestError> {
        let uploading_id = claim.entry().uploading_id;
        info!(
            worker = %self.worker_id,
            uploading_id,
            attempts = claim.entry().attempts,
            stage = "claimed",
            "upload claimed"
        );

        let mut written: Vec<String> = Vec::new();
        let timeout = self.options.unit_timeout;
        let processed = tokio::time::timeout(timeout, self.process(claim.entry(), &mut written))
            .await
            .unwrap_or(Err(IngestError::Timeout(timeout)));

        let committed = match processed {
            Ok(upload) => {
                let chunk_count = upload.chunks.len();
                claim
                    .commit(upload)
                    .await
                    .map(|file_id| (file_id, chunk_count))
            }
            Err(error) => Err(error),
        };

        match committed {
            Ok((file_id, chunk_count)) => {
                info!(uploading_id, file_id, chunk_count, stage = "persisted", "upload persisted");
                report.persisted.push((uploading_id, file_id));
            }
            Err(error) => {
                self.discard(&written).await;
                let failure = Failure::from_error(&error, self.options.retry.max_attempts);
                let outcome = claim.release(&failure).await?;
                warn!(
                    uploading_id,
                    attempts = outcome.attempts,
                    quarantined = outcome.quarantined,
                    %error,
                    "upload released"
                );
                if outcome.quarantined {
                    report.quarantined.push(uploading_id);
                } else {
                    report.retried.push(uploading_id);
                }
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        entry: &QueueEntry,
        written: &mut Vec<String>,
    ) -> Result<PersistedUpload, IngestError> {
        if !entry.extension.eq_ignore_ascii_case(SUPPORTED_EXTENSION) {
            return Err(IngestError::Validation(format!(
                "unsupported extension {:?}",
                entry.extension
            )));
        }
        let raw = entry.raw_bytes.as_slice();
        let sha256 = digest_bytes(raw);
        let total_pages = page_count(raw)?;

        let pages = self.render_pages(raw, total_pages).await?;
        let extracted = ChunkExtractor::new(
            self.collaborators.segmenter.as_ref(),
            self.options.extraction,
        )
        .extract_chunks(&pages, &entry.display_name)
        .await?;
        info!(
            uploading_id = entry.uploading_id,
            chunk_count = extracted.len(),
            stage = "chunked",
            "upload chunked"
        );

        let stored_key =
            raw_file_key(entry.vetrina_id, entry.uploading_id, &sha256, &entry.extension);
        self.store(written, stored_key.clone(), raw).await?;

        let chunks = self.enrich(entry, &sha256, &pages, &extracted, written).await?;
        info!(
            uploading_id = entry.uploading_id,
            chunk_count = chunks.len(),
            stage = "enriched",
            "chunks enriched"
        );

        let redacted_key = self.redact(entry, &sha256, total_pages, written).await?;
        info!(
            uploading_id = entry.uploading_id,
            redacted = redacted_key.is_some(),
            stage = "redacted",
            "upload redacted"
        );

        Ok(PersistedUpload {
            file: FileRecord {
                vetrina_id: entry.vetrina_id,
                display_name: entry.display_name.clone(),
                extension: entry.extension.to_ascii_lowercase(),
                tag: entry.tag.clone(),
                size_bytes: raw.len() as u64,
                sha256,
                stored_key,
                redacted_key,
                page_count: total_pages,
            },
            chunks,
        })
    }

    async fn render_pages(&self, raw: &[u8], total_pages: u32) -> Result<Vec<DynamicImage>, IngestError> {
        if total_pages == 0 {
            return Err(IngestError::Validation("document has no pages".to_string()));
        }
        let mut pages = Vec::with_capacity(total_pages as usize);
        for page_number in 1..=total_pages {
            let page = self
                .collaborators
                .renderer
                .render_page(raw, page_number, self.options.render_dpi)
                .await?;
            pages.push(page);
        }
        Ok(pages)
    }

    /// Crops and embeds every chunk while holding one lease on the scorer.
    async fn enrich(
        &self,
        entry: &QueueEntry,
        sha256: &str,
        pages: &[DynamicImage],
        extracted: &[ExtractedChunk],
        written: &mut Vec<String>,
    ) -> Result<Vec<ChunkRecord>, IngestError> {
        let scorer = self.collaborators.scorer.acquire().await?;
        let embedder = &self.collaborators.embedder;
        let mut records = Vec::with_capacity(extracted.len());

        for chunk in extracted {
            let page = (chunk.page_number as usize)
                .checked_sub(1)
                .and_then(|index| pages.get(index))
                .ok_or_else(|| {
                    IngestError::ProtocolViolation(format!(
                        "chunk {} points at missing page {}",
                        chunk.chunk_id, chunk.page_number
                    ))
                })?;

            let selection = select_best_window(
                &*scorer,
                page,
                &chunk.description,
                &self.options.windows,
                chunk.page_number,
            )
            .await?;
            let image_key = crop_key(
                entry.vetrina_id,
                entry.uploading_id,
                sha256,
                chunk.page_number,
                chunk.chunk_id,
            );
            self.store(written, image_key.clone(), &encode_png(&selection.crop)?)
                .await?;

            let text = format!("{}\n\n{}", chunk.description, chunk.context);
            let embedding = embedder.embed_image_text(page, &text).await?;
            if embedding.len() != embedder.dimensions() {
                return Err(CollaboratorError::BadResponse {
                    collaborator: "embedder".to_string(),
                    details: format!(
                        "embedding has {} dimensions, expected {}",
                        embedding.len(),
                        embedder.dimensions()
                    ),
                }
                .into());
            }

            records.push(ChunkRecord {
                page_number: chunk.page_number,
                description: chunk.description.clone(),
                context: chunk.context.clone(),
                embedding,
                image_key,
                window_score: selection.score,
            });
        }
        Ok(records)
    }

    async fn redact(
        &self,
        entry: &QueueEntry,
        sha256: &str,
        total_pages: u32,
        written: &mut Vec<String>,
    ) -> Result<Option<String>, IngestError> {
        let pages: Vec<u32> = self
            .options
            .redaction
            .pages
            .iter()
            .copied()
            .filter(|&page| page >= 1 && page <= total_pages)
            .collect();
        if pages.is_empty() {
            debug!(uploading_id = entry.uploading_id, total_pages, "no configured page to redact");
            return Ok(None);
        }

        let redactor = Redactor::new(
            Arc::clone(&self.collaborators.renderer),
            self.options.redaction.clone(),
        );
        let redacted = redactor.redact(&entry.raw_bytes, &pages).await?;
        let key = redacted_file_key(entry.vetrina_id, entry.uploading_id, sha256);
        self.store(written, key.clone(), &redacted).await?;
        Ok(Some(key))
    }

    async fn store(&self, written: &mut Vec<String>, key: String, bytes: &[u8]) -> Result<(), IngestError> {
        written.push(key.clone());
        self.collaborators.blobs.put(&key, bytes).await?;
        Ok(())
    }

    async fn discard(&self, written: &[String]) {
        for key in written {
            if let Err(error) = self.collaborators.blobs.delete(key).await {
                warn!(key = key.as_str(), %error, "failed to remove blob of aborted upload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::tests::MemoryBlobStore;
    use crate::config::SearchOptions;
    use crate::embeddings::HashingEmbedder;
    use crate::models::{NewUpload, SearchFilters, SearchQuery};
    use crate::queue::enqueue_upload;
    use crate::redact::tests::{sample_pdf, FlatRenderer};
    use crate::retrieval::HybridSearchEngine;
    use crate::segment::{ConversationState, PageBatch, SegmenterReply};
    use crate::stores::{MemoryStore, VetrinaInfo};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPICS: [&str; 3] = [
        "Definition of variance and its explanation",
        "Standard deviation of a sample",
        "Quartiles and the interquartile range",
    ];

    struct PageSegmenter {
        wrong_page: Option<u32>,
    }

    #[async_trait]
    impl DocumentSegmenter for PageSegmenter {
        async fn segment(
            &self,
            batch: &PageBatch<'_>,
            _state: &ConversationState,
        ) -> Result<SegmenterReply, CollaboratorError> {
            let chunks: Vec<_> = (0..batch.pages.len() as u32)
                .map(|offset| {
                    let page = batch.first_page + offset;
                    json!({
                        "id": batch.next_chunk_id + offset,
                        "description": TOPICS[(page as usize - 1) % TOPICS.len()],
                        "context": format!("Lecture notes, page {page}"),
                        "pageNumber": self.wrong_page.unwrap_or(page),
                    })
                })
                .collect();
            Ok(SegmenterReply {
                content: json!({ "chunks": chunks }).to_string(),
            })
        }
    }

    struct HalfScorer;

    #[async_trait]
    impl RelevanceScorer for HalfScorer {
        async fn score_relevance(
            &self,
            _text: &str,
            _image: &DynamicImage,
        ) -> Result<f32, CollaboratorError> {
            Ok(0.5)
        }
    }

    #[derive(Clone, Default)]
    struct CountingLoader {
        unloads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        type Model = HalfScorer;

        async fn load(&self) -> Result<HalfScorer, CollaboratorError> {
            Ok(HalfScorer)
        }

        fn unload(&self, _model: HalfScorer) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        fn dimensions(&self) -> usize {
            8
        }

        async fn embed_text(&self, _text: &str) -> Result<Vec<f32>, CollaboratorError> {
            Err(CollaboratorError::Unavailable("embedder".to_string()))
        }

        async fn embed_image_text(
            &self,
            _image: &DynamicImage,
            _text: &str,
        ) -> Result<Vec<f32>, CollaboratorError> {
            Err(CollaboratorError::Unavailable("embedder".to_string()))
        }
    }

    struct Harness {
        store: MemoryStore,
        blobs: Arc<MemoryBlobStore>,
        loader: CountingLoader,
        worker: IngestionWorker<MemoryStore, CountingLoader>,
    }

    fn harness(segmenter: PageSegmenter, embedder: Arc<dyn Embedder>) -> Harness {
        let store = MemoryStore::new();
        store.register_vetrina(VetrinaInfo {
            vetrina_id: 10,
            name: "Statistica - appunti".to_string(),
            author_username: "giulia".to_string(),
            course_name: "Statistica".to_string(),
            faculty_name: "Economia".to_string(),
            canale: "A".to_string(),
            course_year: 2,
        });
        let blobs = Arc::new(MemoryBlobStore::default());
        let loader = CountingLoader::default();
        let options = IngestionOptions {
            render_dpi: 36,
            ..Default::default()
        };
        let worker = IngestionWorker::new(
            store.clone(),
            Collaborators {
                embedder,
                scorer: ScopedModel::new(loader.clone()),
                segmenter: Arc::new(segmenter),
                renderer: Arc::new(FlatRenderer),
                blobs: blobs.clone(),
            },
            options,
        )
        .unwrap();
        Harness {
            store,
            blobs,
            loader,
            worker,
        }
    }

    fn upload() -> NewUpload {
        NewUpload {
            requester_id: 1,
            vetrina_id: 10,
            raw_bytes: sample_pdf(3),
            display_name: "Statistica descrittiva".to_string(),
            extension: "pdf".to_string(),
            tag: Some("appunti".to_string()),
        }
    }

    #[tokio::test]
    async fn upload_is_chunked_enriched_redacted_and_persisted() {
        let harness = harness(
            PageSegmenter { wrong_page: None },
            Arc::new(HashingEmbedder::default()),
        );
        let id = enqueue_upload(&harness.store, upload()).await.unwrap();

        let report = harness.worker.drain().await.unwrap();
        assert_eq!(report.persisted.len(), 1);
        assert_eq!(report.persisted[0].0, id);
        assert_eq!(harness.store.pending_count().await.unwrap(), 0);
        assert!(harness.store.queue_entry(id).is_none());

        let files = harness.store.files();
        let (file_id, file) = &files[0];
        assert_eq!(file.page_count, 3);
        assert!(file.redacted_key.is_some());

        let chunks = harness.store.chunks_of(*file_id);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.embedding.len() == 128));
        assert!(chunks.iter().all(|chunk| chunk.window_score == 0.5));

        let keys = harness.blobs.keys();
        assert_eq!(keys.len(), 5);
        assert!(keys.contains(&file.stored_key));
        for chunk in &chunks {
            assert!(keys.contains(&chunk.image_key));
        }

        let redacted = harness
            .blobs
            .get(file.redacted_key.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(page_count(&redacted).unwrap(), 3);

        assert_eq!(harness.loader.unloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn protocol_violations_quarantine_without_retry() {
        let harness = harness(
            PageSegmenter {
                wrong_page: Some(99),
            },
            Arc::new(HashingEmbedder::default()),
        );
        let id = enqueue_upload(&harness.store, upload()).await.unwrap();

        let report = harness.worker.drain().await.unwrap();
        assert_eq!(report.quarantined, vec![id]);

        let entry = harness.store.queue_entry(id).unwrap();
        assert!(entry.failed);
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_error.unwrap().contains("protocol violation"));
        assert!(harness.blobs.keys().is_empty());
        assert!(harness.store.files().is_empty());
    }

    #[tokio::test]
    async fn collaborator_failures_retry_until_the_ceiling() {
        let harness = harness(PageSegmenter { wrong_page: None }, Arc::new(DownEmbedder));
        let id = enqueue_upload(&harness.store, upload()).await.unwrap();

        for attempt in 1..=2 {
            let report = harness.worker.drain().await.unwrap();
            assert_eq!(report.retried, vec![id]);
            assert_eq!(report.attempted(), 1);
            let entry = harness.store.queue_entry(id).unwrap();
            assert_eq!(entry.attempts, attempt);
            assert!(!entry.failed);
        }

        let report = harness.worker.drain().await.unwrap();
        assert_eq!(report.quarantined, vec![id]);
        assert_eq!(harness.store.pending_count().await.unwrap(), 0);

        assert!(harness.blobs.keys().is_empty());
        assert!(harness.store.files().is_empty());
        assert_eq!(harness.loader.unloads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_upload_leaves_indexed_blobs_in_place() {
        let harness = harness(
            PageSegmenter { wrong_page: None },
            Arc::new(HashingEmbedder::default()),
        );
        enqueue_upload(&harness.store, upload()).await.unwrap();
        harness.worker.drain().await.unwrap();
        let before = harness.blobs.keys();
        assert_eq!(before.len(), 5);

        let duplicate = enqueue_upload(&harness.store, upload()).await.unwrap();
        let report = harness.worker.drain().await.unwrap();
        assert!(report.persisted.is_empty());
        assert_eq!(report.retried, vec![duplicate]);
        assert!(harness
            .store
            .queue_entry(duplicate)
            .unwrap()
            .last_error
            .unwrap()
            .contains("conflict"));

        assert_eq!(harness.blobs.keys(), before);
        let files = harness.store.files();
        assert_eq!(files.len(), 1);
        let file = &files[0].1;
        assert!(harness.blobs.get(&file.stored_key).await.is_ok());
        assert!(harness
            .blobs
            .get(file.redacted_key.as_deref().unwrap())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn ingested_chunks_are_searchable() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        let harness = harness(PageSegmenter { wrong_page: None }, embedder.clone());
        enqueue_upload(&harness.store, upload()).await.unwrap();
        harness.worker.drain().await.unwrap();

        let engine = HybridSearchEngine::new(harness.store.clone(), embedder, SearchOptions::default());
        let response = engine
            .search(&SearchQuery {
                text: "variance explanation".to_string(),
                filters: SearchFilters {
                    course_name: Some("Statistica".to_string()),
                    language: Some("en".to_string()),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        assert_eq!(response.results.len(), 3);
        let top = &response.results[0];
        assert_eq!(top.chunk_description, TOPICS[0]);
        assert!(top.keyword_score > 0.0);
        assert!(top.semantic_score > 0.0);
        assert_eq!(top.display.file_name, "Statistica descrittiva");
        assert_eq!(top.display.author_username, "giulia");

        let filtered = engine
            .search(&SearchQuery {
                text: "variance".to_string(),
                filters: SearchFilters {
                    extension: Some("docx".to_string()),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert!(filtered.results.is_empty());
    }
}
