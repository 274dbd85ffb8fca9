use crate::error::{IngestError, SearchError};
use crate::language::TextSearchLanguage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Extension accepted by the ingestion pipeline.
pub const SUPPORTED_EXTENSION: &str = "pdf";

/// A pending upload, owned by whichever worker currently holds its claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub uploading_id: i64,
    pub requester_id: i64,
    pub vetrina_id: i64,
    #[serde(skip)]
    pub raw_bytes: Vec<u8>,
    pub display_name: String,
    pub extension: String,
    pub tag: Option<String>,
    pub upload_time: DateTime<Utc>,
    pub failed: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub requester_id: i64,
    pub vetrina_id: i64,
    pub raw_bytes: Vec<u8>,
    pub display_name: String,
    pub extension: String,
    pub tag: Option<String>,
}

impl NewUpload {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.raw_bytes.is_empty() {
            return Err(IngestError::Validation("uploaded file is empty".to_string()));
        }
        if self.display_name.trim().is_empty() {
            return Err(IngestError::Validation("display name is empty".to_string()));
        }
        if !self.extension.eq_ignore_ascii_case(SUPPORTED_EXTENSION) {
            return Err(IngestError::Validation(format!(
                "unsupported extension {:?}, expected {SUPPORTED_EXTENSION}",
                self.extension
            )));
        }
        Ok(())
    }
}

/// One chunk as produced by segmentation, before enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedChunk {
    pub chunk_id: u32,
    pub description: String,
    pub context: String,
    pub page_number: u32,
}

/// Identity of an indexed chunk; ordering is the search tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub vetrina_id: i64,
    pub file_id: i64,
    pub page_number: u32,
    pub description: String,
}

/// An enriched chunk ready to be written; `file_id` is assigned on commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub page_number: u32,
    pub description: String,
    pub context: String,
    pub embedding: Vec<f32>,
    pub image_key: String,
    pub window_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub vetrina_id: i64,
    pub display_name: String,
    pub extension: String,
    pub tag: Option<String>,
    pub size_bytes: u64,
    pub sha256: String,
    pub stored_key: String,
    pub redacted_key: Option<String>,
    pub page_count: u32,
}

/// Everything one unit of work writes, persisted atomically with the queue entry's removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedUpload {
    pub file: FileRecord,
    pub chunks: Vec<ChunkRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct SearchFilters {
    pub vetrina_id: Option<i64>,
    pub course_name: Option<String>,
    pub faculty_name: Option<String>,
    pub canale: Option<String>,
    pub course_year: Option<i32>,
    pub tag: Option<String>,
    pub extension: Option<String>,
    /// Language hint (`en`/`it`); detection is used when absent.
    pub language: Option<String>,
}

impl SearchFilters {
    /// Filters that live on the file table rather than on vetrina/course.
    pub fn has_file_filters(&self) -> bool {
        self.tag.is_some() || self.extension.is_some()
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        let text_filters = [
            ("course_name", &self.course_name),
            ("faculty_name", &self.faculty_name),
            ("canale", &self.canale),
            ("tag", &self.tag),
            ("extension", &self.extension),
        ];
        for (name, value) in text_filters {
            if value.as_deref().is_some_and(|value| value.trim().is_empty()) {
                return Err(SearchError::Validation(format!("filter {name} is empty")));
            }
        }
        if let Some(year) = self.course_year {
            if !(1..=6).contains(&year) {
                return Err(SearchError::Validation(format!(
                    "course_year must be between 1 and 6, got {year}"
                )));
            }
        }
        if let Some(extension) = &self.extension {
            if !extension.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                return Err(SearchError::Validation(format!(
                    "extension {extension:?} is not alphanumeric"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    pub text: String,
    pub filters: SearchFilters,
}

/// Display metadata joined back onto a ranked chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDisplay {
    pub vetrina_name: String,
    pub author_username: String,
    pub course_name: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedChunk {
    pub key: ChunkKey,
    pub display: ChunkDisplay,
}

/// Both branch rankings for one request, each in rank order (rank 1 first).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchRankings {
    pub semantic: Vec<RankedChunk>,
    pub keyword: Vec<RankedChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub vetrina_id: i64,
    pub file_id: i64,
    pub page_number: u32,
    pub chunk_description: String,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub combined_score: f64,
    pub display: ChunkDisplay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub language: TextSearchLanguage,
    /// Set when the semantic branch was skipped because the query could not be embedded.
    pub degraded: bool,
    pub results: Vec<SearchResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> NewUpload {
        NewUpload {
            requester_id: 7,
            vetrina_id: 3,
            raw_bytes: b"%PDF-1.5".to_vec(),
            display_name: "Statistica - appunti".to_string(),
            extension: "PDF".to_string(),
            tag: Some("appunti".to_string()),
        }
    }

    #[test]
    fn upload_validation_rejects_empty_and_foreign_files() {
        assert!(upload().validate().is_ok());

        let mut empty = upload();
        empty.raw_bytes.clear();
        assert!(matches!(empty.validate(), Err(IngestError::Validation(_))));

        let mut docx = upload();
        docx.extension = "docx".to_string();
        assert!(docx.validate().is_err());
    }

    #[test]
    fn chunk_keys_order_by_identity_fields() {
        let first = ChunkKey {
            vetrina_id: 1,
            file_id: 9,
            page_number: 4,
            description: "b".to_string(),
        };
        let second = ChunkKey {
            vetrina_id: 1,
            file_id: 9,
            page_number: 4,
            description: "c".to_string(),
        };
        assert!(first < second);
    }

    #[test]
    fn file_filters_are_detected() {
        let mut filters = SearchFilters {
            course_name: Some("Statistica".to_string()),
            ..Default::default()
        };
        assert!(!filters.has_file_filters());
        filters.extension = Some("pdf".to_string());
        assert!(filters.has_file_filters());
    }

    #[test]
    fn blank_filters_and_bad_years_are_rejected() {
        let blank = SearchFilters {
            faculty_name: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(matches!(blank.validate(), Err(SearchError::Validation(_))));

        let year = SearchFilters {
            course_year: Some(12),
            ..Default::default()
        };
        assert!(year.validate().is_err());
    }
}
