//! Model-free embedder based on signed feature hashing.
//!
//! Each text is lowercased and split into alphanumeric words. Common
//! function words are dropped and a light suffix stemmer folds inflections
//! (`jumps`, `jumped`, `jumping` → `jump`). Every remaining token is hashed
//! with SHA-256 into one of `dims` buckets with a ±1 sign, and the result is
//! L2-normalized.
//!
//! Rewordings that keep the content words score close to 1.0, while texts
//! with no shared content words score close to 0.0. It runs locally with no
//! model download, which makes it the default provider and the test stub.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EmbeddingProvider;
use crate::error::EmbeddingError;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "for", "from", "has", "have",
    "in", "into", "is", "it", "its", "of", "on", "or", "over", "so", "than", "that", "the",
    "their", "then", "there", "these", "this", "those", "to", "was", "were", "will", "with",
];

/// Deterministic bag-of-words embedder.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Embed synchronously. Fails only on text without any word characters.
    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut words = content_tokens(text);
        if words.is_empty() {
            // Only function words: fall back to using them.
            words = raw_tokens(text).map(stem).collect();
        }
        if words.is_empty() {
            return Err(EmbeddingError::EmptyText);
        }

        let mut vector = vec![0.0f32; self.dims];
        for word in &words {
            let (bucket, sign) = self.bucket(word);
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(head);
        let bucket = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
        (bucket, sign)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed_sync(t)).collect()
    }
}

fn raw_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Lowercased, stop-word-filtered, stemmed tokens.
pub fn content_tokens(text: &str) -> Vec<String> {
    raw_tokens(text)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .map(stem)
        .collect()
}

fn stem(word: String) -> String {
    let len = word.chars().count();
    let cut = if len > 5 && word.ends_with("ing") {
        3
    } else if len > 4 && (word.ends_with("ed") || word.ends_with("ly")) {
        2
    } else if len > 3 && word.ends_with('s') && !word.ends_with("ss") {
        1
    } else {
        0
    };
    if cut == 0 {
        word
    } else {
        word[..word.len() - cut].to_string()
    }
}
