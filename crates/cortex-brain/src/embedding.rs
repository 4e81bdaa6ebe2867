//! Embedding collaborator interface.
//!
//! The store never computes vectors itself. Callers attach an [`Embedder`]
//! to a [`crate::Brain`] handle; writes then embed their text before the
//! write transaction, and [`crate::Brain::embed_pending`] fills any gaps.
//!
//! # Implementations
//!
//! - [`MockEmbedder`]: deterministic word-hashing vectors for tests and offline use

use std::sync::Arc;

use crate::error::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Embedder Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for generating text embeddings.
///
/// Implementations report failures as [`crate::BrainError::EmbeddingUnavailable`].
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts in a batch.
    ///
    /// Default implementation calls `embed` for each text sequentially.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    /// Dimensionality of embeddings produced by this embedder.
    fn dimensions(&self) -> usize;

    /// Model tag recorded next to stored vectors.
    fn name(&self) -> &str;
}

/// A shared embedder that can be attached to many handles.
pub type SharedEmbedder = Arc<dyn Embedder>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Embedder
// ─────────────────────────────────────────────────────────────────────────────

/// A deterministic embedder for testing purposes.
///
/// Each lowercase word is hashed into a signed bucket, so texts sharing words
/// have a positive cosine similarity and identical texts have similarity 1.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    /// Create a new mock embedder with the specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0.0f32; self.dimensions];

        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase());
        for word in words {
            let hash = simple_hash(&word);
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        } else {
            // No words: a fixed unit vector keeps cosine distance defined.
            embedding[0] = 1.0;
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// djb2 string hash.
fn simple_hash(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cosine similarity of two equal-length vectors; 0 when either is zero.
    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            return 0.0;
        }
        dot / (na * nb)
    }

    #[test]
    fn test_mock_embedder_deterministic() {
        let embedder = MockEmbedder::new(64);
        let a = embedder.embed("trading patterns").unwrap();
        let b = embedder.embed("Trading  patterns!").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_mock_embedder_normalized() {
        let embedder = MockEmbedder::new(32);
        for text in ["hello world", "", "   "] {
            let v = embedder.embed(text).unwrap();
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm {} for {:?}", norm, text);
        }
    }

    #[test]
    fn test_shared_words_are_similar() {
        let embedder = MockEmbedder::new(256);
        let q = embedder.embed("market volatility").unwrap();
        let close = embedder.embed("volatility in the market today").unwrap();
        let far = embedder.embed("garden tomatoes").unwrap();
        assert!(cosine_similarity(&q, &close) > cosine_similarity(&q, &far));
        assert!((cosine_similarity(&q, &q) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_embed_batch_default() {
        let embedder = MockEmbedder::new(16);
        let batch = embedder.embed_batch(&["a", "b c"]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1], embedder.embed("b c").unwrap());
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
