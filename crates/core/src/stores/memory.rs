//! Process-local queue and chunk index with the same contract as the Postgres store.

use crate::embeddings::cosine_distance;
use crate::error::{IngestError, SearchError};
use crate::language::TextSearchLanguage;
use crate::models::{
    BranchRankings, ChunkDisplay, ChunkKey, ChunkRecord, FileRecord, NewUpload, PersistedUpload,
    QueueEntry, RankedChunk, SearchFilters,
};
use crate::traits::{ChunkIndex, Failure, QueueClaim, QueueStore, RankingRequest, ReleaseOutcome};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

const ENGLISH_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "the", "to", "with",
];
const ITALIAN_STOPWORDS: &[&str] = &[
    "a", "al", "alla", "che", "con", "da", "dei", "del", "della", "di", "e", "gli", "i", "il",
    "in", "la", "le", "lo", "per", "su", "un", "una",
];
const STEM_LEN: usize = 6;

/// Vetrina and course attributes the filters and display metadata read from.
#[derive(Debug, Clone)]
pub struct VetrinaInfo {
    pub vetrina_id: i64,
    pub name: String,
    pub author_username: String,
    pub course_name: String,
    pub faculty_name: String,
    pub canale: String,
    pub course_year: i32,
}

#[derive(Debug, Clone)]
struct StoredChunk {
    file_id: i64,
    vetrina_id: i64,
    record: ChunkRecord,
}

impl StoredChunk {
    fn key(&self) -> ChunkKey {
        ChunkKey {
            vetrina_id: self.vetrina_id,
            file_id: self.file_id,
            page_number: self.record.page_number,
            description: self.record.description.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    next_upload_id: i64,
    next_file_id: i64,
    queue: BTreeMap<i64, QueueEntry>,
    claimed: HashSet<i64>,
    vetrine: HashMap<i64, VetrinaInfo>,
    files: BTreeMap<i64, FileRecord>,
    chunks: Vec<StoredChunk>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_vetrina(&self, info: VetrinaInfo) {
        lock(&self.state).vetrine.insert(info.vetrina_id, info);
    }

    pub fn queue_entry(&self, uploading_id: i64) -> Option<QueueEntry> {
        lock(&self.state).queue.get(&uploading_id).cloned()
    }

    pub fn files(&self) -> Vec<(i64, FileRecord)> {
        lock(&self.state)
            .files
            .iter()
            .map(|(id, file)| (*id, file.clone()))
            .collect()
    }

    pub fn chunks_of(&self, file_id: i64) -> Vec<ChunkRecord> {
        lock(&self.state)
            .chunks
            .iter()
            .filter(|chunk| chunk.file_id == file_id)
            .map(|chunk| chunk.record.clone())
            .collect()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    type Claim = MemoryClaim;

    async fn enqueue(&self, upload: NewUpload) -> Result<i64, IngestError> {
        let mut state = lock(&self.state);
        state.next_upload_id += 1;
        let uploading_id = state.next_upload_id;
        state.queue.insert(
            uploading_id,
            QueueEntry {
                uploading_id,
                requester_id: upload.requester_id,
                vetrina_id: upload.vetrina_id,
                raw_bytes: upload.raw_bytes,
                display_name: upload.display_name,
                extension: upload.extension.to_ascii_lowercase(),
                tag: upload.tag,
                upload_time: Utc::now(),
                failed: false,
                attempts: 0,
                last_error: None,
            },
        );
        Ok(uploading_id)
    }

    async fn pending_count(&self) -> Result<u64, IngestError> {
        let state = lock(&self.state);
        Ok(state.queue.values().filter(|entry| !entry.failed).count() as u64)
    }

    async fn claim_next(&self, exclude: &[i64]) -> Result<Option<MemoryClaim>, IngestError> {
        let mut state = lock(&self.state);
        let next = state
            .queue
            .values()
            .filter(|entry| {
                !entry.failed
                    && !state.claimed.contains(&entry.uploading_id)
                    && !exclude.contains(&entry.uploading_id)
            })
            .min_by_key(|entry| (entry.upload_time, entry.uploading_id))
            .cloned();

        Ok(next.map(|entry| {
            state.claimed.insert(entry.uploading_id);
            MemoryClaim {
                state: Arc::clone(&self.state),
                entry,
            }
        }))
    }

    async fn requeue_failed(&self, uploading_id: i64) -> Result<bool, IngestError> {
        let mut state = lock(&self.state);
        match state.queue.get_mut(&uploading_id) {
            Some(entry) if entry.failed => {
                entry.failed = false;
                entry.attempts = 0;
                entry.last_error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub struct MemoryClaim {
    state: Arc<Mutex<State>>,
    entry: QueueEntry,
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        lock(&self.state).claimed.remove(&self.entry.uploading_id);
    }
}

#[async_trait]
impl QueueClaim for MemoryClaim {
    fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    async fn commit(&mut self, upload: PersistedUpload) -> Result<i64, IngestError> {
        let mut state = lock(&self.state);
        let file = upload.file;

        if state
            .files
            .values()
            .any(|stored| stored.vetrina_id == file.vetrina_id && stored.sha256 == file.sha256)
        {
            return Err(IngestError::PersistenceConflict(format!(
                "file {} already stored in vetrina {}",
                file.sha256, file.vetrina_id
            )));
        }
        let mut identities = HashSet::new();
        for chunk in &upload.chunks {
            if !identities.insert((chunk.page_number, chunk.description.as_str())) {
                return Err(IngestError::PersistenceConflict(format!(
                    "duplicate chunk {:?} on page {}",
                    chunk.description, chunk.page_number
                )));
            }
        }

        state.next_file_id += 1;
        let file_id = state.next_file_id;
        let vetrina_id = file.vetrina_id;
        state.files.insert(file_id, file);
        state
            .chunks
            .extend(upload.chunks.into_iter().map(|record| StoredChunk {
                file_id,
                vetrina_id,
                record,
            }));
        state.queue.remove(&self.entry.uploading_id);
        Ok(file_id)
    }

    async fn release(self, failure: &Failure) -> Result<ReleaseOutcome, IngestError> {
        let mut state = lock(&self.state);
        let Some(entry) = state.queue.get_mut(&self.entry.uploading_id) else {
            return Err(IngestError::PersistenceConflict(format!(
                "upload {} vanished while claimed",
                self.entry.uploading_id
            )));
        };
        entry.attempts = self.entry.attempts.saturating_add(1);
        entry.failed = failure.quarantines(entry.attempts);
        entry.last_error = Some(failure.message.clone());
        Ok(ReleaseOutcome {
            attempts: entry.attempts,
            quarantined: entry.failed,
        })
    }
}

fn stopwords(language: TextSearchLanguage) -> &'static [&'static str] {
    match language {
        TextSearchLanguage::English => ENGLISH_STOPWORDS,
        TextSearchLanguage::Italian => ITALIAN_STOPWORDS,
    }
}

/// Lowercased word prefixes with stopwords removed; a rough stand-in for a stemmer.
fn lexemes(text: &str, language: TextSearchLanguage) -> Vec<String> {
    let stopwords = stopwords(language);
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .filter(|word| !stopwords.contains(&word.as_str()))
        .map(|word| word.chars().take(STEM_LEN).collect())
        .collect()
}

fn matches_filters(
    filters: &SearchFilters,
    vetrina: &VetrinaInfo,
    file: &FileRecord,
) -> bool {
    let text_eq = |filter: &Option<String>, value: &str| filter.as_deref().map_or(true, |f| f == value);
    filters.vetrina_id.map_or(true, |id| id == vetrina.vetrina_id)
        && text_eq(&filters.course_name, &vetrina.course_name)
        && text_eq(&filters.faculty_name, &vetrina.faculty_name)
        && text_eq(&filters.canale, &vetrina.canale)
        && filters.course_year.map_or(true, |year| year == vetrina.course_year)
        && filters
            .tag
            .as_deref()
            .map_or(true, |tag| file.tag.as_deref() == Some(tag))
        && filters
            .extension
            .as_deref()
            .map_or(true, |ext| ext.eq_ignore_ascii_case(&file.extension))
}

#[async_trait]
impl ChunkIndex for MemoryStore {
    async fn rank_candidates(
        &self,
        request: &RankingRequest<'_>,
    ) -> Result<BranchRankings, SearchError> {
        let state = lock(&self.state);

        let candidates: Vec<(&StoredChunk, ChunkDisplay)> = state
            .chunks
            .iter()
            .filter_map(|chunk| {
                let vetrina = state.vetrine.get(&chunk.vetrina_id)?;
                let file = state.files.get(&chunk.file_id)?;
                matches_filters(request.filters, vetrina, file).then(|| {
                    let display = ChunkDisplay {
                        vetrina_name: vetrina.name.clone(),
                        author_username: vetrina.author_username.clone(),
                        course_name: vetrina.course_name.clone(),
                        file_name: file.display_name.clone(),
                    };
                    (chunk, display)
                })
            })
            .collect();

        let mut semantic = Vec::new();
        if let Some(vector) = request.query_vector {
            let mut scored: Vec<(f64, ChunkKey, ChunkDisplay)> = candidates
                .iter()
                .map(|(chunk, display)| {
                    (
                        cosine_distance(vector, &chunk.record.embedding),
                        chunk.key(),
                        display.clone(),
                    )
                })
                .collect();
            scored.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
            });
            semantic = scored
                .into_iter()
                .take(request.semantic_limit)
                .map(|(_, key, display)| RankedChunk { key, display })
                .collect();
        }

        let terms = lexemes(request.query_text, request.language);
        let mut keyword = Vec::new();
        if !terms.is_empty() {
            let mut scored: Vec<(usize, ChunkKey, ChunkDisplay)> = candidates
                .iter()
                .filter_map(|(chunk, display)| {
                    let words = lexemes(&chunk.record.description, request.language);
                    // Every query term must occur, like plainto_tsquery.
                    if !terms.iter().all(|term| words.contains(term)) {
                        return None;
                    }
                    let hits = words.iter().filter(|word| terms.contains(word)).count();
                    Some((hits, chunk.key(), display.clone()))
                })
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
            keyword = scored
                .into_iter()
                .take(request.keyword_limit)
                .map(|(_, key, display)| RankedChunk { key, display })
                .collect();
        }

        Ok(BranchRankings { semantic, keyword })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str) -> NewUpload {
        NewUpload {
            requester_id: 1,
            vetrina_id: 10,
            raw_bytes: name.as_bytes().to_vec(),
            display_name: name.to_string(),
            extension: "pdf".to_string(),
            tag: None,
        }
    }

    fn failure(retryable: bool) -> Failure {
        Failure {
            message: "embedder unavailable".to_string(),
            retryable,
            max_attempts: 2,
        }
    }

    fn persisted(sha: &str, descriptions: &[&str]) -> PersistedUpload {
        PersistedUpload {
            file: FileRecord {
                vetrina_id: 10,
                display_name: format!("{sha}.pdf"),
                extension: "pdf".to_string(),
                tag: Some("appunti".to_string()),
                size_bytes: 12,
                sha256: sha.to_string(),
                stored_key: format!("files/10/{sha}.pdf"),
                redacted_key: None,
                page_count: 1,
            },
            chunks: descriptions
                .iter()
                .map(|description| ChunkRecord {
                    page_number: 1,
                    description: description.to_string(),
                    context: String::new(),
                    embedding: vec![1.0, 0.0],
                    image_key: "crops/x.png".to_string(),
                    window_score: 0.5,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn claimed_entries_are_invisible_to_other_claimers() {
        let store = MemoryStore::new();
        store.enqueue(upload("a")).await.unwrap();
        store.enqueue(upload("b")).await.unwrap();

        let first = store.claim_next(&[]).await.unwrap().unwrap();
        let second = store.claim_next(&[]).await.unwrap().unwrap();
        assert_ne!(first.entry().uploading_id, second.entry().uploading_id);
        assert!(store.claim_next(&[]).await.unwrap().is_none());

        drop(first);
        assert!(store.claim_next(&[]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_workers_process_each_entry_exactly_once() {
        let store = MemoryStore::new();
        for index in 0..20 {
            store.enqueue(upload(&format!("doc-{index}"))).await.unwrap();
        }

        let mut workers = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            workers.push(tokio::spawn(async move {
                let mut processed = Vec::new();
                while let Some(mut claim) = store.claim_next(&[]).await.unwrap() {
                    let id = claim.entry().uploading_id;
                    let sha = format!("sha-{id}");
                    claim.commit(persisted(&sha, &["topic"])).await.unwrap();
                    processed.push(id);
                    tokio::task::yield_now().await;
                }
                processed
            }));
        }

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (1..=20).collect::<Vec<i64>>());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_counts_attempts_and_quarantines_at_the_ceiling() {
        let store = MemoryStore::new();
        let id = store.enqueue(upload("a")).await.unwrap();

        let claim = store.claim_next(&[]).await.unwrap().unwrap();
        let outcome = claim.release(&failure(true)).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome { attempts: 1, quarantined: false });

        let claim = store.claim_next(&[]).await.unwrap().unwrap();
        let outcome = claim.release(&failure(true)).await.unwrap();
        assert!(outcome.quarantined);
        assert!(store.claim_next(&[]).await.unwrap().is_none());
        assert_eq!(store.pending_count().await.unwrap(), 0);

        assert!(store.requeue_failed(id).await.unwrap());
        assert_eq!(store.queue_entry(id).unwrap().attempts, 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_retryable_failures_quarantine_immediately() {
        let store = MemoryStore::new();
        store.enqueue(upload("a")).await.unwrap();
        let claim = store.claim_next(&[]).await.unwrap().unwrap();
        let outcome = claim.release(&failure(false)).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome { attempts: 1, quarantined: true });
    }

    #[tokio::test]
    async fn duplicate_files_are_persistence_conflicts() {
        let store = MemoryStore::new();
        store.enqueue(upload("a")).await.unwrap();
        store.enqueue(upload("b")).await.unwrap();

        let mut claim = store.claim_next(&[]).await.unwrap().unwrap();
        claim.commit(persisted("same", &["topic"])).await.unwrap();
        drop(claim);

        let mut claim = store.claim_next(&[]).await.unwrap().unwrap();
        assert!(matches!(
            claim.commit(persisted("same", &["topic"])).await,
            Err(IngestError::PersistenceConflict(_))
        ));
        assert_eq!(store.files().len(), 1);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn excluded_entries_are_skipped() {
        let store = MemoryStore::new();
        let first = store.enqueue(upload("a")).await.unwrap();
        let second = store.enqueue(upload("b")).await.unwrap();
        let claim = store.claim_next(&[first]).await.unwrap().unwrap();
        assert_eq!(claim.entry().uploading_id, second);
    }

    #[test]
    fn lexemes_drop_stopwords_per_language() {
        assert_eq!(
            lexemes("The variance of the data", TextSearchLanguage::English),
            vec!["varian", "data"]
        );
        assert_eq!(
            lexemes("la varianza della popolazione", TextSearchLanguage::Italian),
            vec!["varian", "popola"]
        );
    }
}
