//! Vector storage abstraction.
//!
//! The [`VectorStore`] trait defines the durable, per-collection index of
//! [`ContentUnit`]s used by the analyzer. Backends (in-memory, SQLite) must
//! guarantee:
//!
//! - at most one stored entry per unit identity;
//! - atomic visibility: a reader observes an upsert entirely or not at all;
//! - upserts to one collection are serialized, while queries never wait on
//!   that writer lock.
//!
//! [`Collection`] is the handle callers work with. It wraps a store and a
//! collection name and adds a per-operation deadline plus bounded retry of
//! transient failures.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`open_collection`](VectorStore::open_collection) | Create or reopen a collection with a fixed dimension |
//! | [`upsert`](VectorStore::upsert) | Insert a unit or refresh its metadata |
//! | [`query`](VectorStore::query) | k-nearest neighbours by cosine score |
//! | [`contains`](VectorStore::contains) | Existence check by identity |
//! | [`count`](VectorStore::count) | Number of stored units |
//! | [`clear`](VectorStore::clear) | Drop every unit and restart the sequence |

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ContentUnit, UnitRef};

/// Metadata of an opened collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub dims: usize,
    pub len: usize,
}

/// What happens to `indexed_at` when an already-stored identity is upserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshPolicy {
    /// Keep the original sequence number so the first occurrence stays canonical.
    #[default]
    KeepFirst,
    /// Assign a fresh sequence number on every upsert.
    Latest,
}

/// Result of an [`upsert`](VectorStore::upsert).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub identity: String,
    pub indexed_at: u64,
    /// `false` when the identity already existed and only metadata was refreshed.
    pub inserted: bool,
}

/// A stored unit returned from [`query`](VectorStore::query).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredUnit {
    pub unit: UnitRef,
    pub score: f32,
}

/// Abstract storage backend.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if absent. Reopening with the same dimension is
    /// a no-op; a different dimension fails with [`Error::DimensionMismatch`].
    async fn open_collection(&self, name: &str, dims: usize) -> Result<CollectionInfo>;

    /// Store `unit` keyed by its identity, returning the assigned sequence.
    async fn upsert(
        &self,
        collection: &str,
        unit: &ContentUnit,
        policy: RefreshPolicy,
    ) -> Result<UpsertOutcome>;

    /// Up to `k` stored units with score ≥ `min_score`, best first. Equal
    /// scores are ordered by ascending `indexed_at`. A unit whose identity
    /// equals `exclude` is never returned.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        min_score: f32,
        exclude: Option<&str>,
    ) -> Result<Vec<ScoredUnit>>;

    async fn contains(&self, collection: &str, identity: &str) -> Result<bool>;

    async fn count(&self, collection: &str) -> Result<usize>;

    /// Remove every unit of `collection` and restart its sequence at 1,
    /// returning how many units were removed. The collection stays open with
    /// its dimension unchanged.
    async fn clear(&self, collection: &str) -> Result<usize>;

    /// Release backend resources. Default is a no-op.
    async fn close(&self) {}
}

/// Fail with [`Error::DimensionMismatch`] unless `actual == expected`.
pub fn check_dims(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::DimensionMismatch { expected, actual })
    }
}

/// Order candidates best first, earliest indexed first on ties, and keep `k`.
pub fn rank_candidates(candidates: &mut Vec<ScoredUnit>, k: usize) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.unit.age_key().cmp(&b.unit.age_key()))
    });
    candidates.truncate(k);
}

/// Deadline and retry settings applied to every store operation.
#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub timeout: Duration,
    /// Retries after the first attempt for transient errors.
    pub max_retries: u32,
    /// Base delay; doubles per retry, capped at 32× base.
    pub backoff: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl StoreLimits {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Handle to one opened collection.
///
/// Constructed explicitly with [`Collection::open`] and passed by reference
/// into analyzer calls; there is no process-wide registry.
pub struct Collection {
    store: Arc<dyn VectorStore>,
    name: String,
    dims: usize,
    limits: StoreLimits,
    policy: RefreshPolicy,
}

impl Collection {
    /// Open (creating if needed) `name` with vectors of length `dims`.
    pub async fn open(
        store: Arc<dyn VectorStore>,
        name: &str,
        dims: usize,
        limits: StoreLimits,
    ) -> Result<Self> {
        let collection = Self {
            store,
            name: name.to_string(),
            dims,
            limits,
            policy: RefreshPolicy::default(),
        };
        let info = collection
            .with_retry("open", || {
                let this = &collection;
                async move { this.store.open_collection(&this.name, this.dims).await }
            })
            .await?;
        tracing::debug!(collection = %info.name, dims = info.dims, len = info.len, "collection opened");
        Ok(collection)
    }

    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub async fn upsert(&self, unit: &ContentUnit) -> Result<UpsertOutcome> {
        check_dims(self.dims, unit.vector.len())?;
        self.with_retry("upsert", move || {
            self.store.upsert(&self.name, unit, self.policy)
        })
        .await
    }

    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        min_score: f32,
        exclude: Option<&str>,
    ) -> Result<Vec<ScoredUnit>> {
        check_dims(self.dims, vector.len())?;
        self.with_retry("query", move || {
            self.store.query(&self.name, vector, k, min_score, exclude)
        })
        .await
    }

    pub async fn contains(&self, identity: &str) -> Result<bool> {
        self.with_retry("contains", move || self.store.contains(&self.name, identity))
            .await
    }

    pub async fn len(&self) -> Result<usize> {
        self.with_retry("count", move || self.store.count(&self.name))
            .await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Empty the collection. Returns the number of units removed.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self
            .with_retry("clear", move || self.store.clear(&self.name))
            .await?;
        tracing::info!(collection = %self.name, removed, "collection cleared");
        Ok(removed)
    }

    /// Close the underlying store.
    pub async fn close(self) {
        self.store.close().await;
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let result = match tokio::time::timeout(self.limits.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(Error::StoreTimeout {
                    operation,
                    elapsed: started.elapsed(),
                }),
            };

            match result {
                Err(err) if err.is_transient() && attempt < self.limits.max_retries => {
                    attempt += 1;
                    let delay = self.limits.delay(attempt);
                    tracing::warn!(
                        collection = %self.name,
                        operation,
                        attempt,
                        error = %err,
                        "transient store failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
