use crate::error::CollaboratorError;
use crate::traits::Embedder;
use async_trait::async_trait;
use image::DynamicImage;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Weight of the image histogram relative to the text trigrams.
const IMAGE_WEIGHT: f32 = 0.25;
const HISTOGRAM_BINS: usize = 16;

/// Deterministic local embedder: hashed character trigrams, optionally mixed with a
/// coarse luminance histogram. Text-only and image+text vectors share one space.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashingEmbedder {
    fn trigram_counts(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let chars: Vec<char> = text.to_lowercase().chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        vector
    }

    fn luminance_histogram(image: &DynamicImage) -> [f32; HISTOGRAM_BINS] {
        let mut bins = [0f32; HISTOGRAM_BINS];
        let luma = image.thumbnail(64, 64).to_luma8();
        for pixel in luma.pixels() {
            bins[pixel.0[0] as usize * HISTOGRAM_BINS / 256] += 1.0;
        }
        bins
    }
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in &mut vector {
            *value /= magnitude;
        }
    }
    vector
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        Ok(normalize(self.trigram_counts(text)))
    }

    async fn embed_image_text(
        &self,
        image: &DynamicImage,
        text: &str,
    ) -> Result<Vec<f32>, CollaboratorError> {
        let mut vector = normalize(self.trigram_counts(text));
        let histogram = normalize(Self::luminance_histogram(image).to_vec());
        let len = vector.len();
        for (index, weight) in histogram.into_iter().enumerate() {
            vector[index % len] += weight * IMAGE_WEIGHT;
        }
        Ok(normalize(vector))
    }
}

pub fn cosine_distance(left: &[f32], right: &[f32]) -> f64 {
    let dot: f64 = left
        .iter()
        .zip(right)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum();
    let left_norm = left.iter().map(|a| f64::from(*a).powi(2)).sum::<f64>().sqrt();
    let right_norm = right.iter().map(|b| f64::from(*b).powi(2)).sum::<f64>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 1.0;
    }
    1.0 - dot / (left_norm * right_norm)
}
