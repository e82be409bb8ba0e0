//! SQLite-backed [`VectorStore`] implementation.
//!
//! Units live in the `units` table with their embedding stored as a
//! little-endian `f32` BLOB. Each upsert runs in one transaction, so a
//! concurrent reader sees the unit entirely or not at all (WAL mode gives
//! readers a consistent snapshot without blocking on the writer).
//!
//! Upserts to one collection are additionally serialized by an in-process
//! async mutex so sequence numbers are assigned without contention on the
//! SQLite write lock. Queries never take that mutex.
//!
//! Vector search is brute-force: every embedding in the collection is
//! decoded and scored. That is adequate for documentation-sized corpora.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use semdup_core::embedding::{blob_to_vec, similarity_score, vec_to_blob};
use semdup_core::error::{Error, Result};
use semdup_core::models::{ContentUnit, UnitRef};
use semdup_core::store::{
    check_dims, rank_candidates, CollectionInfo, RefreshPolicy, ScoredUnit, UpsertOutcome,
    VectorStore,
};

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SqliteStore {
    /// Wrap a pool whose schema was created by [`crate::migrate`].
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn writer(&self, collection: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection.to_string())
            .or_default()
            .clone()
    }

    async fn collection_dims(&self, collection: &str) -> Result<usize> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM collections WHERE name = ?")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        dims.map(|d| d as usize).ok_or_else(|| {
            Error::StoreUnavailable(format!("collection '{}' is not open", collection))
        })
    }
}

fn unavailable(err: sqlx::Error) -> Error {
    Error::StoreUnavailable(err.to_string())
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn open_collection(&self, name: &str, dims: usize) -> Result<CollectionInfo> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT OR IGNORE INTO collections (name, dims, next_seq, created_at) VALUES (?, ?, 1, ?)",
        )
        .bind(name)
        .bind(dims as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        let stored = self.collection_dims(name).await?;
        check_dims(stored, dims)?;

        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM units WHERE collection = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(CollectionInfo {
            name: name.to_string(),
            dims,
            len: len as usize,
        })
    }

    async fn upsert(
        &self,
        collection: &str,
        unit: &ContentUnit,
        policy: RefreshPolicy,
    ) -> Result<UpsertOutcome> {
        let writer = self.writer(collection);
        let _guard = writer.lock().await;

        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let row = sqlx::query("SELECT dims, next_seq FROM collections WHERE name = ?")
            .bind(collection)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| {
                Error::StoreUnavailable(format!("collection '{}' is not open", collection))
            })?;
        let dims: i64 = row.get("dims");
        let fresh_seq: i64 = row.get("next_seq");
        check_dims(dims as usize, unit.vector.len())?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT indexed_at FROM units WHERE collection = ? AND identity = ?",
        )
        .bind(collection)
        .bind(&unit.identity)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        let (indexed_at, inserted) = match (existing, policy) {
            (Some(seq), RefreshPolicy::KeepFirst) => (seq, false),
            (Some(_), RefreshPolicy::Latest) => (fresh_seq, false),
            (None, _) => (fresh_seq, true),
        };

        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO units (collection, identity, source_file, source_index,
                               normalized_text, raw_text, embedding, indexed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, identity) DO UPDATE SET
                source_file = excluded.source_file,
                source_index = excluded.source_index,
                raw_text = excluded.raw_text,
                embedding = excluded.embedding,
                indexed_at = excluded.indexed_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(&unit.identity)
        .bind(&unit.source_file)
        .bind(unit.source_index as i64)
        .bind(&unit.normalized_text)
        .bind(&unit.raw_text)
        .bind(vec_to_blob(&unit.vector))
        .bind(indexed_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        if indexed_at == fresh_seq {
            sqlx::query("UPDATE collections SET next_seq = next_seq + 1 WHERE name = ?")
                .bind(collection)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;

        tracing::debug!(
            collection,
            identity = %unit.identity,
            indexed_at,
            inserted,
            "unit upserted"
        );
        Ok(UpsertOutcome {
            identity: unit.identity.clone(),
            indexed_at: indexed_at as u64,
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
        let dims = self.collection_dims(collection).await?;
        check_dims(dims, vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT identity, source_file, source_index, normalized_text, embedding, indexed_at
            FROM units
            WHERE collection = ?
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut candidates: Vec<ScoredUnit> = Vec::new();
        for row in rows {
            let identity: String = row.get("identity");
            if Some(identity.as_str()) == exclude {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let score = similarity_score(vector, &blob_to_vec(&blob));
            if score < min_score {
                continue;
            }
            let source_index: i64 = row.get("source_index");
            let indexed_at: i64 = row.get("indexed_at");
            candidates.push(ScoredUnit {
                unit: UnitRef {
                    identity,
                    source_file: row.get("source_file"),
                    source_index: source_index as usize,
                    indexed_at: Some(indexed_at as u64),
                    text: row.get("normalized_text"),
                },
                score,
            });
        }

        rank_candidates(&mut candidates, k);
        Ok(candidates)
    }

    async fn contains(&self, collection: &str, identity: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM units WHERE collection = ? AND identity = ?")
                .bind(collection)
                .bind(identity)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(found.is_some())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM units WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(n as usize)
    }

    async fn clear(&self, collection: &str) -> Result<usize> {
        let writer = self.writer(collection);
        let _guard = writer.lock().await;

        self.collection_dims(collection).await?;
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let removed = sqlx::query("DELETE FROM units WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?
            .rows_affected();
        sqlx::query("UPDATE collections SET next_seq = 1 WHERE name = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;

        Ok(removed as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn temp_store(dir: &tempfile::TempDir) -> SqliteStore {
        let path = dir.path().join("units.sqlite");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn unit(source: &str, index: usize, text: &str, vector: Vec<f32>) -> ContentUnit {
        ContentUnit::new(source, index, text, text, vector)
    }

    #[tokio::test]
    async fn test_open_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        assert_eq!(store.open_collection("docs", 2).await.unwrap().len, 0);
        assert_eq!(store.open_collection("docs", 2).await.unwrap().dims, 2);
        assert!(matches!(
            store.open_collection("docs", 3).await,
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_upsert_assigns_sequence_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        store.open_collection("docs", 2).await.unwrap();

        let a = unit("a.md", 0, "first stored unit", vec![1.0, 0.0]);
        let b = unit("b.md", 0, "second stored unit", vec![0.0, 1.0]);

        let first = store.upsert("docs", &a, RefreshPolicy::KeepFirst).await.unwrap();
        let second = store.upsert("docs", &b, RefreshPolicy::KeepFirst).await.unwrap();
        assert_eq!((first.indexed_at, first.inserted), (1, true));
        assert_eq!((second.indexed_at, second.inserted), (2, true));

        let again = store.upsert("docs", &a, RefreshPolicy::KeepFirst).await.unwrap();
        assert_eq!((again.indexed_at, again.inserted), (1, false));
        assert_eq!(store.count("docs").await.unwrap(), 2);

        let latest = store.upsert("docs", &a, RefreshPolicy::Latest).await.unwrap();
        assert_eq!(latest.indexed_at, 3);
        assert_eq!(store.count("docs").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_query_orders_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        store.open_collection("docs", 2).await.unwrap();

        let exact = unit("a.md", 0, "exact direction", vec![1.0, 0.0]);
        let near = unit("b.md", 0, "near direction", vec![0.9, 0.1]);
        let far = unit("c.md", 0, "far direction", vec![0.0, 1.0]);
        for u in [&exact, &near, &far] {
            store.upsert("docs", u, RefreshPolicy::KeepFirst).await.unwrap();
        }

        let results = store
            .query("docs", &[1.0, 0.0], 10, 0.5, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].unit.identity, exact.identity);
        assert_eq!(results[1].unit.identity, near.identity);
        assert!(results[0].score >= results[1].score);

        let excluded = store
            .query("docs", &[1.0, 0.0], 10, 0.5, Some(&exact.identity))
            .await
            .unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].unit.identity, near.identity);

        let top1 = store.query("docs", &[1.0, 0.0], 1, 0.0, None).await.unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_checks() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        store.open_collection("docs", 2).await.unwrap();
        assert!(matches!(
            store
                .upsert("docs", &unit("a.md", 0, "three dims", vec![1.0, 0.0, 0.0]), RefreshPolicy::KeepFirst)
                .await,
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(matches!(
            store.query("docs", &[1.0], 5, 0.0, None).await,
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(matches!(
            store.query("missing", &[1.0, 0.0], 5, 0.0, None).await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let u = unit("a.md", 0, "durable unit text", vec![0.6, 0.8]);
        {
            let store = temp_store(&dir).await;
            store.open_collection("docs", 2).await.unwrap();
            store.upsert("docs", &u, RefreshPolicy::KeepFirst).await.unwrap();
            store.close().await;
        }
        let store = temp_store(&dir).await;
        let info = store.open_collection("docs", 2).await.unwrap();
        assert_eq!(info.len, 1);
        assert!(store.contains("docs", &u.identity).await.unwrap());
        let next = unit("b.md", 0, "another durable unit", vec![0.8, 0.6]);
        let outcome = store.upsert("docs", &next, RefreshPolicy::KeepFirst).await.unwrap();
        assert_eq!(outcome.indexed_at, 2);
    }

    #[tokio::test]
    async fn test_clear_keeps_collection_and_restarts_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        store.open_collection("docs", 2).await.unwrap();
        store.open_collection("other", 2).await.unwrap();
        for i in 0..3 {
            let u = unit("a.md", i, &format!("stored unit {}", i), vec![1.0, 0.0]);
            store.upsert("docs", &u, RefreshPolicy::KeepFirst).await.unwrap();
        }
        let kept = unit("k.md", 0, "unit in another collection", vec![0.0, 1.0]);
        store.upsert("other", &kept, RefreshPolicy::KeepFirst).await.unwrap();

        assert_eq!(store.clear("docs").await.unwrap(), 3);
        assert_eq!(store.count("docs").await.unwrap(), 0);
        assert_eq!(store.count("other").await.unwrap(), 1);
        assert_eq!(store.open_collection("docs", 2).await.unwrap().len, 0);

        let fresh = unit("b.md", 0, "after the reset", vec![0.0, 1.0]);
        let outcome = store.upsert("docs", &fresh, RefreshPolicy::KeepFirst).await.unwrap();
        assert_eq!(outcome.indexed_at, 1);
        assert!(matches!(
            store.clear("missing").await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_repeated_paragraph_copies_stored_separately() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        store.open_collection("docs", 2).await.unwrap();

        let first = unit("a.md", 0, "the same paragraph twice", vec![1.0, 0.0]);
        let second = unit("a.md", 2, "the same paragraph twice", vec![1.0, 0.0]).with_occurrence(1);
        store.upsert("docs", &first, RefreshPolicy::KeepFirst).await.unwrap();
        store.upsert("docs", &second, RefreshPolicy::KeepFirst).await.unwrap();
        assert_eq!(store.count("docs").await.unwrap(), 2);

        let results = store
            .query("docs", &[1.0, 0.0], 10, 0.9, Some(&second.identity))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].unit.source_index, 0);
        assert_eq!(results[0].unit.indexed_at, Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_get_distinct_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(temp_store(&dir).await);
        store.open_collection("docs", 2).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let u = unit("c.md", i, &format!("concurrent unit {}", i), vec![1.0, i as f32]);
                store
                    .upsert("docs", &u, RefreshPolicy::KeepFirst)
                    .await
                    .unwrap()
                    .indexed_at
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=16).collect::<Vec<u64>>());
        assert_eq!(store.count("docs").await.unwrap(), 16);
    }
}
