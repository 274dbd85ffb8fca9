//! Drives the multi-turn segmentation collaborator over page batches and enforces chunk ordering.

use crate::config::ExtractionOptions;
use crate::error::{CollaboratorError, IngestError};
use crate::models::ExtractedChunk;
use crate::traits::DocumentSegmenter;
use image::DynamicImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub first_page: u32,
    pub last_page: u32,
    pub content: String,
}

/// Prior exchanges with the segmenter. Never mutated in place; each batch yields a new state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn with_exchange(&self, pages: RangeInclusive<u32>, request: String, reply: String) -> Self {
        let mut turns = self.turns.clone();
        turns.push(Turn {
            role: Role::User,
            first_page: *pages.start(),
            last_page: *pages.end(),
            content: request,
        });
        turns.push(Turn {
            role: Role::Assistant,
            first_page: *pages.start(),
            last_page: *pages.end(),
            content: reply,
        });
        Self { turns }
    }
}

/// One request to the segmenter.
#[derive(Debug, Clone, Copy)]
pub struct PageBatch<'a> {
    pub document_name: &'a str,
    pub first_page: u32,
    pub total_pages: u32,
    /// Lowest chunk id the segmenter may use for a new chunk.
    pub next_chunk_id: u32,
    pub pages: &'a [DynamicImage],
}

impl PageBatch<'_> {
    pub fn last_page(&self) -> u32 {
        self.first_page + self.pages.len() as u32 - 1
    }

    pub fn instructions(&self) -> String {
        format!(
            "Document \"{}\", pages {}-{} of {}. Continue the segmentation: return JSON \
             {{\"chunks\": [{{\"id\", \"description\", \"context\", \"pageNumber\"}}]}} with ids \
             starting at {}. Descriptions summarise the topic; never copy source text.",
            self.document_name,
            self.first_page,
            self.last_page(),
            self.total_pages,
            self.next_chunk_id
        )
    }
}

/// Raw text the segmenter produced for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmenterReply {
    pub content: String,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct RawChunk {
    #[serde(alias = "chunk_id", alias = "chunkId")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    id: u32,
    description: String,
    #[serde(default)]
    context: String,
    #[serde(rename = "pageNumber", alias = "page_number", alias = "page")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    page_number: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SegmentPayload {
    Wrapped { chunks: Vec<RawChunk> },
    Bare(Vec<RawChunk>),
}

const CODE_FENCE: &str = r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$";

/// Parses one reply into chunks; any schema mismatch is reported as malformed output.
pub fn parse_reply(content: &str) -> Result<Vec<ExtractedChunk>, String> {
    let fence = Regex::new(CODE_FENCE).map_err(|error| error.to_string())?;
    let body = fence
        .captures(content)
        .and_then(|captures| captures.get(1))
        .map_or(content, |inner| inner.as_str());

    let payload: SegmentPayload =
        serde_json::from_str(body.trim()).map_err(|error| error.to_string())?;
    let raw = match payload {
        SegmentPayload::Wrapped { chunks } | SegmentPayload::Bare(chunks) => chunks,
    };

    raw.into_iter()
        .map(|chunk| {
            let description = chunk.description.trim().to_string();
            if description.is_empty() {
                return Err(format!("chunk {} has an empty description", chunk.id));
            }
            Ok(ExtractedChunk {
                chunk_id: chunk.id,
                description,
                context: chunk.context.trim().to_string(),
                page_number: chunk.page_number,
            })
        })
        .collect()
}

/// Inclusive 1-based page ranges: one larger leading batch, then fixed-size batches.
pub fn plan_batches(total_pages: u32, options: &ExtractionOptions) -> Vec<RangeInclusive<u32>> {
    let mut batches = Vec::new();
    let mut start = 1u32;
    let mut size = options.first_batch_pages.max(1);
    while start <= total_pages {
        let end = start.saturating_add(size - 1).min(total_pages);
        batches.push(start..=end);
        start = end + 1;
        size = options.batch_pages.max(1);
    }
    batches
}

/// Checks a batch against what was accepted so far: strictly increasing ids,
/// non-decreasing pages, pages within the document.
fn validate_batch(
    batch: &[ExtractedChunk],
    accepted: &[ExtractedChunk],
    total_pages: u32,
) -> Result<(), IngestError> {
    let mut last = accepted.last().map(|chunk| (chunk.chunk_id, chunk.page_number));

    for chunk in batch {
        if chunk.page_number == 0 || chunk.page_number > total_pages {
            return Err(IngestError::ProtocolViolation(format!(
                "chunk {} points at page {} outside 1..={total_pages}",
                chunk.chunk_id, chunk.page_number
            )));
        }
        if let Some((last_id, last_page)) = last {
            if chunk.chunk_id <= last_id {
                return Err(IngestError::ProtocolViolation(format!(
                    "chunk id {} does not follow {last_id}",
                    chunk.chunk_id
                )));
            }
            if chunk.page_number < last_page {
                return Err(IngestError::ProtocolViolation(format!(
                    "chunk {} moves back to page {} after page {last_page}",
                    chunk.chunk_id, chunk.page_number
                )));
            }
        }
        last = Some((chunk.chunk_id, chunk.page_number));
    }

    Ok(())
}

pub struct ChunkExtractor<'a, S: DocumentSegmenter + ?Sized> {
    segmenter: &'a S,
    options: ExtractionOptions,
}

impl<'a, S: DocumentSegmenter + ?Sized> ChunkExtractor<'a, S> {
    pub fn new(segmenter: &'a S, options: ExtractionOptions) -> Self {
        Self { segmenter, options }
    }

    /// Segments rendered pages into ordered chunks.
    ///
    /// A malformed reply is retried for that batch only; chunks accepted from earlier
    /// batches are kept. Ordering or page-range violations abort extraction.
    pub async fn extract_chunks(
        &self,
        pages: &[DynamicImage],
        display_name: &str,
    ) -> Result<Vec<ExtractedChunk>, IngestError> {
        self.options.validate()?;
        if pages.is_empty() {
            return Err(IngestError::Validation(format!(
                "{display_name} has no pages to segment"
            )));
        }

        let total_pages = pages.len() as u32;
        let mut state = ConversationState::default();
        let mut accepted: Vec<ExtractedChunk> = Vec::new();

        for range in plan_batches(total_pages, &self.options) {
            let slice = &pages[(*range.start() - 1) as usize..*range.end() as usize];
            let next_chunk_id = match accepted.last() {
                None => 1,
                Some(chunk) => chunk.chunk_id.checked_add(1).ok_or_else(|| {
                    IngestError::ProtocolViolation(format!(
                        "chunk id {} leaves no id for pages from {}",
                        chunk.chunk_id,
                        range.start()
                    ))
                })?,
            };
            let batch = PageBatch {
                document_name: display_name,
                first_page: *range.start(),
                total_pages,
                next_chunk_id,
                pages: slice,
            };

            let (reply, chunks) = self.segment_batch(&batch, &state).await?;
            validate_batch(&chunks, &accepted, total_pages)?;

            debug!(
                first_page = batch.first_page,
                last_page = batch.last_page(),
                chunk_count = chunks.len(),
                "batch segmented"
            );
            state = state.with_exchange(range, batch.instructions(), reply.content);
            accepted.extend(chunks);
        }

        info!(
            document = display_name,
            total_pages,
            chunk_count = accepted.len(),
            "document segmented"
        );
        Ok(accepted)
    }

    async fn segment_batch(
        &self,
        batch: &PageBatch<'_>,
        state: &ConversationState,
    ) -> Result<(SegmenterReply, Vec<ExtractedChunk>), IngestError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let reply = self.segmenter.segment(batch, state).await?;
            match parse_reply(&reply.content) {
                Ok(chunks) => return Ok((reply, chunks)),
                Err(details) if attempt < self.options.max_batch_attempts => {
                    warn!(
                        first_page = batch.first_page,
                        attempt,
                        %details,
                        "malformed segmentation reply, retrying batch"
                    );
                }
                Err(details) => {
                    return Err(IngestError::Collaborator(CollaboratorError::BadResponse {
                        collaborator: "segmenter".to_string(),
                        details: format!(
                            "pages {}-{}: {details} after {attempt} attempts",
                            batch.first_page,
                            batch.last_page()
                        ),
                    }))
                }
            }
        }
    }
}
