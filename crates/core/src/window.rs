//! Localises the horizontal band of a rendered page that best matches a chunk.

use crate::config::WindowOptions;
use crate::error::IngestError;
use crate::traits::RelevanceScorer;
use image::{DynamicImage, GenericImageView};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowLayout {
    pub window_height: u32,
    pub offsets: Vec<u32>,
}

/// The winning band and the score it achieved.
#[derive(Debug, Clone)]
pub struct WindowSelection {
    pub crop: DynamicImage,
    pub score: f32,
    pub band: usize,
    pub top: u32,
}

/// Top offsets of `num_windows` evenly spread bands of `fraction × page_height` rows.
///
/// Every offset lies in `[0, page_height - window_height]`; a single window starts at 0.
pub fn window_layout(page_height: u32, options: &WindowOptions) -> Result<WindowLayout, IngestError> {
    options.validate()?;
    if page_height == 0 {
        return Err(IngestError::Validation("page image has zero height".to_string()));
    }

    let window_height = ((f64::from(page_height) * f64::from(options.window_height_fraction))
        .round() as u32)
        .clamp(1, page_height);
    let max_top = page_height - window_height;

    if options.num_windows == 1 {
        return Ok(WindowLayout {
            window_height,
            offsets: vec![0],
        });
    }

    let step = f64::from(max_top) / (options.num_windows - 1) as f64;
    let offsets = (0..options.num_windows)
        .map(|index| ((index as f64 * step).round() as i64).clamp(0, i64::from(max_top)) as u32)
        .collect();

    Ok(WindowLayout {
        window_height,
        offsets,
    })
}

/// Scores every band against `description` and returns the best one.
///
/// A band whose scoring call fails counts as 0; if every band fails the selection fails.
/// Ties go to the topmost band.
pub async fn select_best_window<S>(
    scorer: &S,
    page: &DynamicImage,
    description: &str,
    options: &WindowOptions,
    page_number: u32,
) -> Result<WindowSelection, IngestError>
where
    S: RelevanceScorer + ?Sized,
{
    let (width, height) = page.dimensions();
    let layout = window_layout(height, options)?;

    let mut best: Option<WindowSelection> = None;
    let mut failures = 0usize;

    for (band, &top) in layout.offsets.iter().enumerate() {
        let crop = page.crop_imm(0, top, width, layout.window_height);
        let score = match scorer.score_relevance(description, &crop).await {
            Ok(score) if score.is_finite() => score,
            Ok(score) => {
                warn!(page_number, band, score, "scorer returned a non-finite score");
                failures += 1;
                0.0
            }
            Err(error) => {
                warn!(page_number, band, %error, "window scoring failed, counting band as 0");
                failures += 1;
                0.0
            }
        };

        let improves = best.as_ref().map_or(true, |current| score > current.score);
        if improves {
            best = Some(WindowSelection {
                crop,
                score,
                band,
                top,
            });
        }
    }

    if failures == layout.offsets.len() {
        return Err(IngestError::WindowSelection { page: page_number });
    }

    let selection = best.ok_or(IngestError::WindowSelection { page: page_number })?;
    debug!(
        page_number,
        band = selection.band,
        top = selection.top,
        score = selection.score,
        "selected window"
    );
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use async_trait::async_trait;
    use image::{GenericImageView, Rgb, RgbImage};
    use std::sync::Mutex;

    /// Returns scores in call order; `None` fails the call.
    struct ScriptedScorer {
        scores: Mutex<Vec<Option<f32>>>,
    }

    impl ScriptedScorer {
        fn new(scores: Vec<Option<f32>>) -> Self {
            Self {
                scores: Mutex::new(scores.into_iter().rev().collect()),
            }
        }
    }

    #[async_trait]
    impl RelevanceScorer for ScriptedScorer {
        async fn score_relevance(
            &self,
            _text: &str,
            _image: &DynamicImage,
        ) -> Result<f32, CollaboratorError> {
            let next = self.scores.lock().unwrap().pop().flatten();
            next.ok_or_else(|| CollaboratorError::Unavailable("scorer".to_string()))
        }
    }

    fn page(height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(40, height, Rgb([240, 240, 240])))
    }

    #[test]
    fn offsets_stay_within_page_bounds() {
        for page_height in [1u32, 2, 7, 100, 1_754] {
            for num_windows in 1..=9 {
                for fraction in [0.05f32, 0.2, 0.33, 0.5, 0.9, 1.0] {
                    let options = WindowOptions {
                        num_windows,
                        window_height_fraction: fraction,
                    };
                    let layout = window_layout(page_height, &options).unwrap();
                    assert_eq!(layout.offsets.len(), num_windows);
                    let max_top = page_height - layout.window_height;
                    assert!(
                        layout.offsets.iter().all(|&top| top <= max_top),
                        "height={page_height} n={num_windows} f={fraction} {:?}",
                        layout.offsets
                    );
                }
            }
        }
    }

    #[test]
    fn bands_spread_from_top_to_bottom() {
        let options = WindowOptions {
            num_windows: 3,
            window_height_fraction: 0.5,
        };
        let layout = window_layout(1_000, &options).unwrap();
        assert_eq!(layout.window_height, 500);
        assert_eq!(layout.offsets, vec![0, 250, 500]);
    }

    #[tokio::test]
    async fn single_window_returns_full_band_with_direct_score() {
        let scorer = ScriptedScorer::new(vec![Some(0.42)]);
        let options = WindowOptions {
            num_windows: 1,
            window_height_fraction: 1.0,
        };
        let selection = select_best_window(&scorer, &page(300), "variance", &options, 1)
            .await
            .unwrap();
        assert_eq!(selection.top, 0);
        assert_eq!(selection.crop.dimensions(), (40, 300));
        assert_eq!(selection.score, 0.42);
    }

    #[tokio::test]
    async fn highest_score_wins_and_ties_go_to_topmost_band() {
        let scorer = ScriptedScorer::new(vec![Some(0.3), Some(0.8), Some(0.8)]);
        let options = WindowOptions {
            num_windows: 3,
            window_height_fraction: 0.4,
        };
        let selection = select_best_window(&scorer, &page(100), "regression", &options, 2)
            .await
            .unwrap();
        assert_eq!(selection.band, 1);
        assert_eq!(selection.score, 0.8);
        assert_eq!(selection.crop.height(), 40);
    }

    #[tokio::test]
    async fn failed_band_counts_as_zero() {
        let scorer = ScriptedScorer::new(vec![None, Some(0.1)]);
        let options = WindowOptions {
            num_windows: 2,
            window_height_fraction: 0.5,
        };
        let selection = select_best_window(&scorer, &page(100), "anova", &options, 1)
            .await
            .unwrap();
        assert_eq!(selection.band, 1);
        assert_eq!(selection.score, 0.1);
    }

    #[tokio::test]
    async fn all_bands_failing_is_an_error() {
        let scorer = ScriptedScorer::new(vec![None, None]);
        let options = WindowOptions {
            num_windows: 2,
            window_height_fraction: 0.5,
        };
        let result = select_best_window(&scorer, &page(100), "anova", &options, 5).await;
        assert!(matches!(result, Err(IngestError::WindowSelection { page: 5 })));
    }
}
