//! Embedding provider trait, caching wrapper, and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, the [`CachedProvider`] decorator that adds a bounded LRU cache
//! keyed by content hash, and pure helpers for similarity and serialization.
//!
//! The model-free [`HashingProvider`] lives here as well; network and ONNX
//! backends live in the `semdup` app crate.

mod hashing;

pub use hashing::HashingProvider;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;

use crate::error::EmbeddingError;
use crate::models::content_hash;

/// Trait for embedding providers.
///
/// Implementations must be deterministic: identical text always yields an
/// identical vector of length [`dims`](EmbeddingProvider::dims).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        match vectors.len() {
            1 => Ok(vectors.remove(0)),
            got => Err(EmbeddingError::CountMismatch { expected: 1, got }),
        }
    }
}

/// Cache counters reported by [`CachedProvider::cache_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Decorator adding an LRU cache and bounded batching to any provider.
///
/// Cache keys are SHA-256 digests of the text, so a hit skips the backend
/// entirely. Misses are deduplicated and sent to the backend in batches of
/// at most `batch_size` texts to cap peak memory. Safe to share across tasks.
pub struct CachedProvider {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    batch_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: usize, batch_size: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            batch_size: batch_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        let entries = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyText);
        }

        let keys: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let mut resolved: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        // Distinct missing texts, in first-seen order.
        let mut missing: Vec<usize> = Vec::new();
        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            for (i, key) in keys.iter().enumerate() {
                if let Some(vector) = cache.get(key) {
                    resolved[i] = Some(vector.clone());
                } else if !missing.iter().any(|&m| keys[m] == *key) {
                    missing.push(i);
                }
            }
        }
        let hit_count = resolved.iter().filter(|r| r.is_some()).count();
        self.hits.fetch_add(hit_count as u64, Ordering::Relaxed);
        self.misses
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        for batch in missing.chunks(self.batch_size) {
            let batch_texts: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed_batch(&batch_texts).await?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: batch.len(),
                    got: vectors.len(),
                });
            }
            tracing::debug!(
                model = self.inner.model_name(),
                batch = batch.len(),
                "embedded batch"
            );

            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            for (&i, vector) in batch.iter().zip(vectors) {
                cache.put(keys[i].clone(), vector.clone());
                resolved[i] = Some(vector);
            }
        }

        // Fill duplicates of texts that were embedded in this call.
        for i in 0..texts.len() {
            if resolved[i].is_none() {
                let source = (0..texts.len())
                    .find(|&j| keys[j] == keys[i] && resolved[j].is_some())
                    .and_then(|j| resolved[j].clone());
                resolved[i] = source;
            }
        }

        resolved
            .into_iter()
            .map(|v| {
                v.ok_or(EmbeddingError::CountMismatch {
                    expected: texts.len(),
                    got: 0,
                })
            })
            .collect()
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use semdup_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, zero
/// vectors, or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Redundancy score in `[0, 1]`: cosine similarity with opposite and
/// orthogonal directions both mapped to `0.0`.
pub fn similarity_score(a: &[f32], b: &[f32]) -> f32 {
    let score = cosine_similarity(a, b);
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}
