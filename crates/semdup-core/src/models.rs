//! Core data models for the redundancy engine.
//!
//! These types flow from the segmenter through the embedder into the store,
//! and back out of the analyzer as matches and reports.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A source document handed to the analyzer by the caller.
#[derive(Debug, Clone)]
pub struct Document {
    /// Source path or identifier (e.g. `docs/setup.md`).
    pub source: String,
    pub body: String,
}

impl Document {
    pub fn new(source: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            body: body.into(),
        }
    }
}

/// A normalized, comparable span of text with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUnit {
    /// SHA-256 of source reference, occurrence, and normalized text. See [`unit_identity`].
    pub identity: String,
    pub source_file: String,
    /// Ordinal position of the unit within its source, starting at 0.
    pub source_index: usize,
    pub normalized_text: String,
    pub raw_text: String,
    pub vector: Vec<f32>,
    /// Collection sequence number assigned on first upsert; `None` until stored.
    pub indexed_at: Option<u64>,
}

impl ContentUnit {
    pub fn new(
        source_file: &str,
        source_index: usize,
        normalized_text: &str,
        raw_text: &str,
        vector: Vec<f32>,
    ) -> Self {
        Self {
            identity: unit_identity(source_file, 0, normalized_text),
            source_file: source_file.to_string(),
            source_index,
            normalized_text: normalized_text.to_string(),
            raw_text: raw_text.to_string(),
            vector,
            indexed_at: None,
        }
    }

    /// Re-key the unit as the `occurrence`-th copy (from 0) of its normalized
    /// text within its source.
    pub fn with_occurrence(mut self, occurrence: usize) -> Self {
        self.identity = unit_identity(&self.source_file, occurrence, &self.normalized_text);
        self
    }

    pub fn to_ref(&self) -> UnitRef {
        UnitRef {
            identity: self.identity.clone(),
            source_file: self.source_file.clone(),
            source_index: self.source_index,
            indexed_at: self.indexed_at,
            text: self.normalized_text.clone(),
        }
    }
}

/// Lightweight reference to a unit, carried in matches and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRef {
    pub identity: String,
    pub source_file: String,
    pub source_index: usize,
    /// `None` for units that were only queried, never indexed.
    pub indexed_at: Option<u64>,
    pub text: String,
}

impl UnitRef {
    /// Sort key for canonical selection: earliest indexed first, unindexed last.
    pub fn age_key(&self) -> (u64, &str) {
        (self.indexed_at.unwrap_or(u64::MAX), &self.identity)
    }
}

/// A scored pair of units. `query` and `candidate` never share an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub query: UnitRef,
    pub candidate: UnitRef,
    /// Cosine-derived score in `[0, 1]`.
    pub score: f32,
}

/// Stable content identity for a unit.
///
/// Identical normalized text from the same source always hashes to the same
/// identity, so re-analysing unchanged content is idempotent. The same text
/// in two different sources yields two identities, which is what allows
/// cross-document duplicates to be reported.
///
/// `occurrence` counts earlier units of the same source with the same
/// normalized text, so a paragraph repeated verbatim inside one file gets
/// one identity per copy. The first copy hashes without an ordinal.
pub fn unit_identity(source_file: &str, occurrence: usize, normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_file.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized_text.as_bytes());
    if occurrence > 0 {
        hasher.update([0u8]);
        hasher.update((occurrence as u64).to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of a text, used as the embedding cache key.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
