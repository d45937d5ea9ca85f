//! Embedding provider abstraction and the deterministic fallback.

use super::{HhniError, HhniResult};
use serde::{Deserialize, Serialize};

/// Dimension of [`FallbackEmbedder`] vectors.
pub const FALLBACK_DIMENSION: usize = 3;
/// Characters sampled by the fallback embedder.
pub const FALLBACK_SAMPLE_CHARS: usize = 64;

/// External text embedding capability. Implementations must be deterministic
/// for the index to be reproducible.
pub trait Embedder: Send + Sync {
    fn encode(&self, text: &str) -> HhniResult<Vec<f32>>;

    /// Encodes several texts; callers keep batches within the safety cap.
    fn encode_batch(&self, texts: &[&str]) -> HhniResult<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.encode(text)).collect()
    }

    fn dimension(&self) -> usize;
}

/// Which embedder a search uses for the query side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// The injected embedder (falls back when none is configured).
    #[default]
    Local,
    /// Always the char-statistics fallback.
    Fallback,
}

/// Char-statistics embedding: `[total, mean, variance]` of the code points of
/// the first 64 characters, each scaled into roughly `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackEmbedder;

impl FallbackEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let codes: Vec<f64> = text
            .chars()
            .take(FALLBACK_SAMPLE_CHARS)
            .map(|ch| f64::from(u32::from(ch).min(0x7f)))
            .collect();
        if codes.is_empty() {
            return vec![0.0; FALLBACK_DIMENSION];
        }
        let count = codes.len() as f64;
        let total: f64 = codes.iter().sum();
        let mean = total / count;
        let variance = codes.iter().map(|code| (code - mean).powi(2)).sum::<f64>() / count;
        vec![
            (total / (FALLBACK_SAMPLE_CHARS as f64 * 127.0)) as f32,
            (mean / 127.0) as f32,
            (variance / (127.0 * 127.0)) as f32,
        ]
    }
}

impl Embedder for FallbackEmbedder {
    fn encode(&self, text: &str) -> HhniResult<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dimension(&self) -> usize {
        FALLBACK_DIMENSION
    }
}

/// Cosine similarity; 0 for empty, mismatched or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Rejects vectors containing NaN or infinity.
pub(crate) fn ensure_finite(vector: &[f32]) -> HhniResult<()> {
    if vector.iter().all(|value| value.is_finite()) {
        return Ok(());
    }
    Err(HhniError::Embedding(
        "embedding contains non-finite values".to_string(),
    ))
}
