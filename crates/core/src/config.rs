use crate::error::{IngestError, SearchError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dots per inch used when a page is rendered for segmentation, window scoring and embedding.
pub const STANDARD_RENDER_DPI: u32 = 150;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowOptions {
    pub num_windows: usize,
    pub window_height_fraction: f32,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            num_windows: 3,
            window_height_fraction: 0.5,
        }
    }
}

impl WindowOptions {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.num_windows == 0 {
            return Err(IngestError::Validation(
                "num_windows must be at least 1".to_string(),
            ));
        }
        let fraction = self.window_height_fraction;
        if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
            return Err(IngestError::Validation(format!(
                "window_height_fraction must lie in (0, 1], got {fraction}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionOptions {
    pub first_batch_pages: u32,
    pub batch_pages: u32,
    pub max_batch_attempts: u32,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            first_batch_pages: 10,
            batch_pages: 5,
            max_batch_attempts: 3,
        }
    }
}

impl ExtractionOptions {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.first_batch_pages == 0 || self.batch_pages == 0 {
            return Err(IngestError::Validation(
                "segmentation batches must contain at least one page".to_string(),
            ));
        }
        if self.max_batch_attempts == 0 {
            return Err(IngestError::Validation(
                "max_batch_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedactionOptions {
    /// Coarser than [`STANDARD_RENDER_DPI`]: the blurred raster does not need detail.
    pub dpi: u32,
    pub blur_sigma: f32,
    pub pages: Vec<u32>,
}

impl Default for RedactionOptions {
    fn default() -> Self {
        Self {
            dpi: 50,
            blur_sigma: 10.0,
            pages: vec![1],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a failing upload is quarantined (`failed = true`).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub render_dpi: u32,
    pub windows: WindowOptions,
    pub extraction: ExtractionOptions,
    pub redaction: RedactionOptions,
    pub retry: RetryPolicy,
    pub unit_timeout: Duration,
    pub max_entries_per_pass: Option<usize>,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            render_dpi: STANDARD_RENDER_DPI,
            windows: WindowOptions::default(),
            extraction: ExtractionOptions::default(),
            redaction: RedactionOptions::default(),
            retry: RetryPolicy::default(),
            unit_timeout: Duration::from_secs(600),
            max_entries_per_pass: None,
        }
    }
}

impl IngestionOptions {
    pub fn validate(&self) -> Result<(), IngestError> {
        self.windows.validate()?;
        self.extraction.validate()?;
        if self.render_dpi == 0 || self.redaction.dpi == 0 {
            return Err(IngestError::Validation("dpi must be positive".to_string()));
        }
        if !self.redaction.blur_sigma.is_finite() || self.redaction.blur_sigma < 0.0 {
            return Err(IngestError::Validation(format!(
                "blur_sigma must be a non-negative number, got {}",
                self.redaction.blur_sigma
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchOptions {
    /// RRF smoothing constant.
    pub k: f64,
    pub semantic_limit: usize,
    pub keyword_limit: usize,
    pub top_n: usize,
    pub timeout: Duration,
    /// Answer with the keyword branch alone when the query cannot be embedded.
    pub keyword_only_on_embedding_failure: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            k: 60.0,
            semantic_limit: 50,
            keyword_limit: 50,
            top_n: 20,
            timeout: Duration::from_secs(10),
            keyword_only_on_embedding_failure: false,
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> Result<(), SearchError> {
        if !self.k.is_finite() || self.k < 0.0 {
            return Err(SearchError::Validation(format!(
                "k must be a non-negative finite number, got {}",
                self.k
            )));
        }
        if self.top_n == 0 {
            return Err(SearchError::Validation("top_n must be positive".to_string()));
        }
        Ok(())
    }
}
