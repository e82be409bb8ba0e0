//! In-memory [`VectorStore`] implementation for tests and embedded use.
//!
//! Each collection keeps its units in a `HashMap` behind `std::sync::RwLock`.
//! Upserts are serialized by a per-collection async writer mutex and commit
//! with a single short write-lock section, so readers see either the old or
//! the new entry. Queries take only the read lock and never touch the writer
//! mutex. Vector search is brute-force cosine similarity.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::embedding::similarity_score;
use crate::error::{Error, Result};
use crate::models::ContentUnit;

use super::{
    check_dims, rank_candidates, CollectionInfo, RefreshPolicy, ScoredUnit, UpsertOutcome,
    VectorStore,
};

struct CollectionState {
    units: HashMap<String, ContentUnit>,
    next_seq: u64,
}

struct MemoryCollection {
    dims: usize,
    writer: tokio::sync::Mutex<()>,
    state: RwLock<CollectionState>,
}

/// In-memory store. Contents live as long as the value.
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Arc<MemoryCollection>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn collection(&self, name: &str) -> Result<Arc<MemoryCollection>> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StoreUnavailable(format!("collection '{}' is not open", name)))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn open_collection(&self, name: &str, dims: usize) -> Result<CollectionInfo> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let collection = collections.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryCollection {
                dims,
                writer: tokio::sync::Mutex::new(()),
                state: RwLock::new(CollectionState {
                    units: HashMap::new(),
                    next_seq: 1,
                }),
            })
        });
        check_dims(collection.dims, dims)?;
        let len = collection
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .units
            .len();
        Ok(CollectionInfo {
            name: name.to_string(),
            dims,
            len,
        })
    }

    async fn upsert(
        &self,
        collection: &str,
        unit: &ContentUnit,
        policy: RefreshPolicy,
    ) -> Result<UpsertOutcome> {
        let coll = self.collection(collection)?;
        check_dims(coll.dims, unit.vector.len())?;

        let _writer = coll.writer.lock().await;
        let mut state = coll.state.write().unwrap_or_else(PoisonError::into_inner);
        let fresh_seq = state.next_seq;

        let (indexed_at, inserted) = match state.units.get(&unit.identity) {
            Some(existing) => match policy {
                RefreshPolicy::KeepFirst => (existing.indexed_at.unwrap_or(fresh_seq), false),
                RefreshPolicy::Latest => (fresh_seq, false),
            },
            None => (fresh_seq, true),
        };
        if indexed_at == fresh_seq {
            state.next_seq += 1;
        }

        let mut stored = unit.clone();
        stored.indexed_at = Some(indexed_at);
        state.units.insert(unit.identity.clone(), stored);

        Ok(UpsertOutcome {
            identity: unit.identity.clone(),
            indexed_at,
            inserted,
        })
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        min_score: f32,
        exclude: Option<&str>,
    ) -> Result<Vec<ScoredUnit>> {
        let coll = self.collection(collection)?;
        check_dims(coll.dims, vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = coll.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidates: Vec<ScoredUnit> = state
            .units
            .values()
            .filter(|u| Some(u.identity.as_str()) != exclude)
            .filter_map(|u| {
                let score = similarity_score(vector, &u.vector);
                (score >= min_score).then(|| ScoredUnit {
                    unit: u.to_ref(),
                    score,
                })
            })
            .collect();
        drop(state);

        rank_candidates(&mut candidates, k);
        Ok(candidates)
    }

    async fn contains(&self, collection: &str, identity: &str) -> Result<bool> {
        let coll = self.collection(collection)?;
        let state = coll.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.units.contains_key(identity))
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let coll = self.collection(collection)?;
        let state = coll.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.units.len())
    }

    async fn clear(&self, collection: &str) -> Result<usize> {
        let coll = self.collection(collection)?;
        let _writer = coll.writer.lock().await;
        let mut state = coll.state.write().unwrap_or_else(PoisonError::into_inner);
        let removed = state.units.len();
        state.units.clear();
        state.next_seq = 1;
        Ok(removed)
    }
}
