//! Embedding computation for the memory pipelines.
//!
//! Provides the [`EmbeddingProvider`] seam, a deterministic hash-based
//! provider for tests and offline use, an LRU-cached wrapper, and
//! [`cosine_similarity`].

use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;

/// Embedding dimension used throughout the memory subsystem.
pub const EMBEDDING_DIM: usize = 384;

// ─── EmbeddingProvider ───────────────────────────────────────────────────────

/// Async seam for computing fixed-dimension text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Return a unit-normalised embedding for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;

    /// Embed a batch; the default implementation loops.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

// ─── cosine_similarity ───────────────────────────────────────────────────────

/// Cosine similarity clamped to `[0, 1]`; zero or mismatched vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
    }
}

// ─── HashEmbedding ───────────────────────────────────────────────────────────

/// Deterministic token-hash embedding provider.
///
/// Same text always produces the same unit vector; different texts almost
/// always differ.  Suitable for tests and for deployments without a real
/// embedding backend.
#[derive(Debug, Default)]
pub struct HashEmbedding;

impl HashEmbedding {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        for token in text.split_whitespace() {
            // FNV-1a over the lowercased token spreads mass across dims.
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in token.to_lowercase().bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            raw[(hash % EMBEDDING_DIM as u64) as usize] += 1.0;
            raw[((hash >> 16) % EMBEDDING_DIM as u64) as usize] += 0.5;
        }
        let mag: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag > 0.0 {
            for v in &mut raw {
                *v /= mag;
            }
        }
        Ok(raw)
    }
}

// ─── LruEmbeddingCache ───────────────────────────────────────────────────────

/// LRU-cached wrapper over any provider, keyed by exact input text.
pub struct LruEmbeddingCache {
    inner: Box<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl LruEmbeddingCache {
    pub fn new(provider: Box<dyn EmbeddingProvider>, capacity: usize) -> Self {
        let cap = std::num::NonZeroUsize::new(capacity.max(1))
            .unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            inner: provider,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LruEmbeddingCache {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        {
            let mut guard = self.cache.lock().map_err(|e| e.to_string())?;
            if let Some(hit) = guard.get(text) {
                return Ok(hit.clone());
            }
        }
        let embedding = self.inner.embed(text).await?;
        {
            let mut guard = self.cache.lock().map_err(|e| e.to_string())?;
            guard.put(text.to_owned(), embedding.clone());
        }
        Ok(embedding)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![0.6f32, 0.8, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-5);
    }

    #[test]
    fn cosine_degenerate_inputs_are_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn hash_embedding_is_deterministic() {
        let provider = HashEmbedding::new();
        let a = provider.embed("the same text").await.unwrap();
        let b = provider.embed("the same text").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn hash_embedding_distinguishes_texts() {
        let provider = HashEmbedding::new();
        let a = provider.embed("databases and indexes").await.unwrap();
        let b = provider.embed("gardening in spring").await.unwrap();
        assert!(cosine_similarity(&a, &b) < 0.9, "unrelated texts should differ");
    }

    #[tokio::test]
    async fn hash_embedding_is_unit_length() {
        let provider = HashEmbedding::new();
        let v = provider.embed("normalise me please").await.unwrap();
        let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn similar_texts_score_higher_than_unrelated() {
        let provider = HashEmbedding::new();
        let base = provider.embed("alice likes green tea").await.unwrap();
        let near = provider.embed("alice likes green tea a lot").await.unwrap();
        let far = provider.embed("rust compiles to machine code").await.unwrap();
        assert!(
            cosine_similarity(&base, &near) > cosine_similarity(&base, &far),
            "token overlap should raise similarity"
        );
    }

    #[tokio::test]
    async fn cache_returns_identical_vectors() {
        let cached = LruEmbeddingCache::new(Box::new(HashEmbedding::new()), 8);
        let a = cached.embed("cache me").await.unwrap();
        let b = cached.embed("cache me").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn batch_embeds_each_text() {
        let provider = HashEmbedding::new();
        let texts = vec!["one".to_string(), "two".to_string()];
        let batch = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], provider.embed("one").await.unwrap());
    }
}
