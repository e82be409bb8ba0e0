//! Similarity analysis pipeline.
//!
//! The [`Analyzer`] ties the pieces together:
//!
//! ```text
//! text ─▶ segment ─▶ embed (batched, cached) ─▶ query collection ─▶ upsert ─▶ matches
//!                                                                              │
//!                                                           build_report ◀─────┘
//! ```
//!
//! # Pass modes
//!
//! In [`PassMode::SinglePass`] each unit is queried against the collection and
//! then indexed, so a unit only matches content indexed strictly before it.
//! A later copy inside one file still matches the earlier one, but the
//! earlier copy never sees the later. [`PassMode::TwoPass`] indexes every unit
//! of a run first and queries afterwards, which reports each such pair from
//! both sides.
//!
//! Every copy of a repeated paragraph is its own unit: identities include the
//! copy's occurrence ordinal within the source (see
//! [`unit_identity`](crate::models::unit_identity)).
//!
//! # Failure handling
//!
//! [`Analyzer::analyze_unit`] and [`Analyzer::analyze_file`] stop at the first
//! error. [`Analyzer::analyze_corpus`] records embedding and transient store
//! failures per unit in the report and keeps going; only configuration-class
//! errors ([`Error::DimensionMismatch`], [`Error::InvalidThreshold`]) abort it.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::embedding::EmbeddingProvider;
use crate::error::{check_threshold, EmbeddingError, Error, Result};
use crate::models::{ContentUnit, Document, SimilarityMatch};
use crate::report::{build_report, RedundancyReport, UnitFailure, DEFAULT_MERGE_THRESHOLD};
use crate::segment::{
    decode_text, normalize_text, segment, Segment, SegmentKind, DEFAULT_MIN_TOKENS,
};
use crate::store::Collection;

/// Default minimum similarity score for a match.
pub const DEFAULT_THRESHOLD: f32 = 0.85;

/// Source label used for ad-hoc text passed to [`Analyzer::analyze_unit`].
pub const INLINE_SOURCE: &str = "<inline>";

/// Default number of texts sent to the embedder in one call.
pub const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassMode {
    /// Query each unit, then index it.
    #[default]
    SinglePass,
    /// Index every unit of the run, then query each.
    TwoPass,
}

#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    /// Maximum candidates returned per query.
    pub top_k: usize,
    pub min_tokens: usize,
    pub merge_threshold: f32,
    pub mode: PassMode,
    /// Upper bound on texts per `embed_batch` call.
    pub batch_size: usize,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_tokens: DEFAULT_MIN_TOKENS,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            mode: PassMode::SinglePass,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Orchestrates segmentation, embedding, and store access.
///
/// Holds only borrowed handles; all persistent state lives in the collection.
pub struct Analyzer<'a> {
    collection: &'a Collection,
    embedder: &'a dyn EmbeddingProvider,
    options: AnalyzerOptions,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        collection: &'a Collection,
        embedder: &'a dyn EmbeddingProvider,
        options: AnalyzerOptions,
    ) -> Self {
        Self {
            collection,
            embedder,
            options,
        }
    }

    pub fn options(&self) -> &AnalyzerOptions {
        &self.options
    }

    /// Find stored units similar to `text` without indexing anything.
    ///
    /// Multi-paragraph text is segmented and every segment queried; matches
    /// are returned in segment order. Text too short to form a segment is
    /// queried as a single unit.
    pub async fn analyze_unit(&self, text: &str, threshold: f32) -> Result<Vec<SimilarityMatch>> {
        let threshold = check_threshold(threshold)?;
        let mut segments = segment(text, self.options.min_tokens);
        if segments.is_empty() {
            let normalized = normalize_text(text);
            if normalized.is_empty() {
                return Err(EmbeddingError::EmptyText.into());
            }
            segments.push(Segment {
                index: 0,
                kind: SegmentKind::Paragraph,
                raw: text.trim().to_string(),
                normalized,
            });
        }

        let units = self.embed_segments(INLINE_SOURCE, &segments).await?;
        let mut matches = Vec::new();
        for unit in &units {
            matches.extend(self.query_unit(unit, threshold).await?);
        }
        Ok(matches)
    }

    /// Analyse a file on disk and index its units.
    ///
    /// Content that is not valid UTF-8 is decoded as Windows-1252 rather
    /// than rejected (see [`decode_text`]).
    pub async fn analyze_file(
        &self,
        path: impl AsRef<Path>,
        threshold: f32,
    ) -> Result<Vec<SimilarityMatch>> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let body = decode_text(&bytes);
        let doc = Document::new(path.display().to_string(), body);
        self.analyze_document(&doc, threshold).await
    }

    /// Analyse one document's text and index its units.
    pub async fn analyze_document(
        &self,
        doc: &Document,
        threshold: f32,
    ) -> Result<Vec<SimilarityMatch>> {
        let threshold = check_threshold(threshold)?;
        let segments = segment(&doc.body, self.options.min_tokens);
        let mut units = self.embed_segments(&doc.source, &segments).await?;

        let mut matches = Vec::new();
        match self.options.mode {
            PassMode::SinglePass => {
                for unit in &mut units {
                    let mut found = self.query_unit(unit, threshold).await?;
                    let outcome = self.collection.upsert(unit).await?;
                    unit.indexed_at = Some(outcome.indexed_at);
                    for m in &mut found {
                        m.query.indexed_at = unit.indexed_at;
                    }
                    matches.extend(found);
                }
            }
            PassMode::TwoPass => {
                for unit in &mut units {
                    let outcome = self.collection.upsert(unit).await?;
                    unit.indexed_at = Some(outcome.indexed_at);
                }
                for unit in &units {
                    matches.extend(self.query_unit(unit, threshold).await?);
                }
            }
        }

        tracing::info!(
            source = %doc.source,
            units = units.len(),
            matches = matches.len(),
            "analyzed document"
        );
        Ok(matches)
    }

    /// Segment, embed, and index a document without querying for matches.
    ///
    /// Returns the number of units stored. Stops at the first error, like
    /// [`analyze_document`](Self::analyze_document).
    pub async fn index_document(&self, doc: &Document) -> Result<usize> {
        let segments = segment(&doc.body, self.options.min_tokens);
        let units = self.embed_segments(&doc.source, &segments).await?;
        for unit in &units {
            self.collection.upsert(unit).await?;
        }
        tracing::info!(source = %doc.source, units = units.len(), "indexed document");
        Ok(units.len())
    }

    /// Analyse every document and build a corpus-wide report.
    ///
    /// Per-unit failures are recorded in [`RedundancyReport::failures`].
    /// `cancel` is checked before each unit; once it fires, the current unit
    /// is finished and the partial report is returned with `cancelled` set.
    pub async fn analyze_corpus(
        &self,
        documents: &[Document],
        threshold: f32,
        cancel: &CancellationToken,
    ) -> Result<RedundancyReport> {
        let threshold = check_threshold(threshold)?;
        let mut failures: Vec<UnitFailure> = Vec::new();
        let mut matches: Vec<SimilarityMatch> = Vec::new();
        let mut indexed: Vec<ContentUnit> = Vec::new();
        let mut analyzed = 0usize;
        let mut files = 0usize;
        let mut cancelled = false;

        'docs: for doc in documents {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let segments = segment(&doc.body, self.options.min_tokens);
            let units = self
                .embed_segments_lenient(&doc.source, &segments, &mut failures)
                .await;

            for mut unit in units {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'docs;
                }

                if self.options.mode == PassMode::SinglePass {
                    let found = match self.query_unit(&unit, threshold).await {
                        Ok(found) => found,
                        Err(err) => {
                            record_failure(&mut failures, &unit, err)?;
                            continue;
                        }
                    };
                    match self.collection.upsert(&unit).await {
                        Ok(outcome) => {
                            unit.indexed_at = Some(outcome.indexed_at);
                            matches.extend(found.into_iter().map(|mut m| {
                                m.query.indexed_at = unit.indexed_at;
                                m
                            }));
                        }
                        Err(err) => {
                            // Matches of a unit that could not be indexed
                            // would point at an identity absent from the store.
                            record_failure(&mut failures, &unit, err)?;
                            continue;
                        }
                    }
                } else {
                    match self.collection.upsert(&unit).await {
                        Ok(outcome) => {
                            unit.indexed_at = Some(outcome.indexed_at);
                            indexed.push(unit);
                        }
                        Err(err) => {
                            record_failure(&mut failures, &unit, err)?;
                            continue;
                        }
                    }
                }
                analyzed += 1;
            }
            files += 1;
        }

        if self.options.mode == PassMode::TwoPass {
            for unit in &indexed {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                match self.query_unit(unit, threshold).await {
                    Ok(found) => matches.extend(found),
                    Err(err) => record_failure(&mut failures, unit, err)?,
                }
            }
        }

        let mut report = build_report(&matches, "corpus", threshold, self.options.merge_threshold);
        report.files_analyzed = files;
        report.units_analyzed = analyzed;
        report.cancelled = cancelled;
        report.failures = failures;

        tracing::info!(
            documents = documents.len(),
            units = analyzed,
            clusters = report.clusters.len(),
            failures = report.failures.len(),
            cancelled,
            "corpus analysis finished"
        );
        Ok(report)
    }

    async fn query_unit(&self, unit: &ContentUnit, threshold: f32) -> Result<Vec<SimilarityMatch>> {
        let candidates = self
            .collection
            .query(
                &unit.vector,
                self.options.top_k,
                threshold,
                Some(&unit.identity),
            )
            .await?;
        let query = unit.to_ref();
        tracing::debug!(
            source = %unit.source_file,
            index = unit.source_index,
            candidates = candidates.len(),
            "queried unit"
        );
        Ok(candidates
            .into_iter()
            .filter(|c| c.unit.identity != unit.identity)
            .map(|c| SimilarityMatch {
                query: query.clone(),
                candidate: c.unit,
                score: c.score,
            })
            .collect())
    }

    async fn embed_segments(&self, source: &str, segments: &[Segment]) -> Result<Vec<ContentUnit>> {
        let occurrences = occurrences(segments);
        let mut units = Vec::with_capacity(segments.len());
        for (chunk, chunk_occurrences) in segments
            .chunks(self.options.batch_size.max(1))
            .zip(occurrences.chunks(self.options.batch_size.max(1)))
        {
            let texts: Vec<String> = chunk.iter().map(|s| s.normalized.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != chunk.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: chunk.len(),
                    got: vectors.len(),
                }
                .into());
            }
            units.extend(
                chunk
                    .iter()
                    .zip(chunk_occurrences)
                    .zip(vectors)
                    .map(|((s, &n), v)| unit_for(source, s, n, v)),
            );
        }
        Ok(units)
    }

    /// Like [`embed_segments`](Self::embed_segments), but a failed batch is
    /// retried unit by unit so one bad unit does not drop its neighbours.
    async fn embed_segments_lenient(
        &self,
        source: &str,
        segments: &[Segment],
        failures: &mut Vec<UnitFailure>,
    ) -> Vec<ContentUnit> {
        match self.embed_segments(source, segments).await {
            Ok(units) => units,
            Err(batch_err) => {
                tracing::warn!(source, error = %batch_err, "batch embedding failed, retrying per unit");
                let mut units = Vec::with_capacity(segments.len());
                for (s, n) in segments.iter().zip(occurrences(segments)) {
                    match self.embedder.embed(&s.normalized).await {
                        Ok(v) => units.push(unit_for(source, s, n, v)),
                        Err(err) => {
                            tracing::warn!(source, index = s.index, error = %err, "skipping unit");
                            failures.push(UnitFailure {
                                source_file: source.to_string(),
                                source_index: Some(s.index),
                                kind: "embedding".to_string(),
                                message: err.to_string(),
                            });
                        }
                    }
                }
                units
            }
        }
    }
}

fn unit_for(source: &str, segment: &Segment, occurrence: usize, vector: Vec<f32>) -> ContentUnit {
    ContentUnit::new(source, segment.index, &segment.normalized, &segment.raw, vector)
        .with_occurrence(occurrence)
}

/// For each segment, how many earlier segments share its normalized text.
fn occurrences(segments: &[Segment]) -> Vec<usize> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    segments
        .iter()
        .map(|s| {
            let count = seen.entry(s.normalized.as_str()).or_insert(0);
            let n = *count;
            *count += 1;
            n
        })
        .collect()
}

/// Record a non-fatal unit failure, or propagate a fatal one.
fn record_failure(failures: &mut Vec<UnitFailure>, unit: &ContentUnit, err: Error) -> Result<()> {
    if matches!(
        err,
        Error::DimensionMismatch { .. } | Error::InvalidThreshold(_)
    ) {
        return Err(err);
    }
    tracing::warn!(
        source = %unit.source_file,
        index = unit.source_index,
        error = %err,
        "unit failed, continuing"
    );
    failures.push(UnitFailure {
        source_file: unit.source_file.clone(),
        source_index: Some(unit.source_index),
        kind: err.kind().to_string(),
        message: err.to_string(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{CachedProvider, HashingProvider};
    use crate::store::memory::InMemoryStore;
    use crate::store::{StoreLimits, VectorStore};
    use crate::report::SuggestedAction;
    use crate::store::{CollectionInfo, RefreshPolicy, ScoredUnit, UpsertOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Maps exact texts to fixed vectors; anything else is a backend failure.
    struct FixedProvider {
        vectors: HashMap<String, Vec<f32>>,
    }

    impl FixedProvider {
        fn new(entries: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: entries
                    .iter()
                    .map(|(t, v)| (t.to_string(), v.clone()))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            texts
                .iter()
                .map(|t| {
                    self.vectors
                        .get(t)
                        .cloned()
                        .ok_or_else(|| EmbeddingError::Unavailable(format!("no vector for '{}'", t)))
                })
                .collect()
        }
    }

    /// Records the size of every batch it is asked to embed.
    struct RecordingProvider {
        inner: HashingProvider,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for RecordingProvider {
        fn model_name(&self) -> &str {
            "recording"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.batches.lock().unwrap().push(texts.len());
            self.inner.embed_batch(texts).await
        }
    }

    /// In-memory store that fires a cancellation token after `limit` upserts.
    struct CancelAfterUpserts {
        inner: InMemoryStore,
        limit: usize,
        upserts: AtomicUsize,
        token: CancellationToken,
    }

    #[async_trait]
    impl VectorStore for CancelAfterUpserts {
        async fn open_collection(&self, name: &str, dims: usize) -> Result<CollectionInfo> {
            self.inner.open_collection(name, dims).await
        }
        async fn upsert(
            &self,
            collection: &str,
            unit: &ContentUnit,
            policy: RefreshPolicy,
        ) -> Result<UpsertOutcome> {
            let outcome = self.inner.upsert(collection, unit, policy).await;
            if self.upserts.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
                self.token.cancel();
            }
            outcome
        }
        async fn query(
            &self,
            collection: &str,
            vector: &[f32],
            k: usize,
            min_score: f32,
            exclude: Option<&str>,
        ) -> Result<Vec<ScoredUnit>> {
            self.inner.query(collection, vector, k, min_score, exclude).await
        }
        async fn contains(&self, collection: &str, identity: &str) -> Result<bool> {
            self.inner.contains(collection, identity).await
        }
        async fn count(&self, collection: &str) -> Result<usize> {
            self.inner.count(collection).await
        }
        async fn clear(&self, collection: &str) -> Result<usize> {
            self.inner.clear(collection).await
        }
    }

    async fn collection(dims: usize) -> Collection {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryStore::new());
        Collection::open(store, "test", dims, StoreLimits::default())
            .await
            .unwrap()
    }

    fn hashing() -> CachedProvider {
        CachedProvider::new(Arc::new(HashingProvider::new(384)), 256, 16)
    }

    const SHARED: &str = "Run the migration script before deploying the new release to production servers.";

    fn doc_a() -> Document {
        Document::new(
            "a.md",
            format!("Alpha notes describe caching strategy for thumbnails.\n\n{}", SHARED),
        )
    }

    fn doc_b() -> Document {
        Document::new(
            "b.md",
            "Gardening tips: water tomatoes every morning.\n\nPrune roses during late winter months.",
        )
    }

    fn doc_c() -> Document {
        Document::new(
            "c.md",
            format!("{}\n\nCharlie covers keyboard shortcuts inside the editor.", SHARED),
        )
    }

    #[tokio::test]
    async fn test_invalid_threshold_rejected() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());

        for bad in [-0.1f32, 1.5, f32::NAN] {
            assert!(matches!(
                analyzer.analyze_unit("some text to check", bad).await,
                Err(Error::InvalidThreshold(_))
            ));
            assert!(matches!(
                analyzer.analyze_document(&doc_a(), bad).await,
                Err(Error::InvalidThreshold(_))
            ));
            assert!(matches!(
                analyzer
                    .analyze_corpus(&[doc_a()], bad, &CancellationToken::new())
                    .await,
                Err(Error::InvalidThreshold(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_paraphrase_scenario() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());

        analyzer
            .analyze_document(
                &Document::new("fox.md", "The quick brown fox jumps over the lazy dog."),
                DEFAULT_THRESHOLD,
            )
            .await
            .unwrap();

        let matches = analyzer
            .analyze_unit("A quick brown fox jumped over a lazy dog.", 0.85)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].score >= 0.85);
        assert_eq!(matches[0].candidate.source_file, "fox.md");

        let unrelated = analyzer
            .analyze_unit("Stock prices fell sharply today.", 0.0)
            .await
            .unwrap();
        assert_eq!(unrelated.len(), 1);
        assert!(unrelated[0].score < 0.5);
    }

    #[tokio::test]
    async fn test_analyze_unit_does_not_index() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());
        analyzer
            .analyze_unit("Nothing here gets stored at all.", 0.5)
            .await
            .unwrap();
        assert!(coll.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_analyze_unit_empty_text() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());
        let err = analyzer.analyze_unit("   \n ", 0.85).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(EmbeddingError::EmptyText)));
    }

    #[tokio::test]
    async fn test_reanalysis_is_idempotent() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());

        analyzer.analyze_document(&doc_a(), 0.85).await.unwrap();
        let size = coll.len().await.unwrap();
        assert_eq!(size, 2);

        let again = analyzer.analyze_document(&doc_a(), 0.85).await.unwrap();
        assert_eq!(coll.len().await.unwrap(), size);
        // Self-exclusion: a unit never matches its own stored copy.
        assert!(again.iter().all(|m| m.query.identity != m.candidate.identity));
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_cross_document_scenario() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());

        let report = analyzer
            .analyze_corpus(
                &[doc_a(), doc_b(), doc_c()],
                DEFAULT_THRESHOLD,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.files_analyzed, 3);
        assert_eq!(report.units_analyzed, 6);
        assert!(!report.cancelled);
        assert!(report.failures.is_empty());

        let cluster = &report.clusters[0];
        assert_eq!(cluster.canonical.source_file, "a.md");
        assert_eq!(cluster.canonical.source_index, 1);
        assert_eq!(cluster.members.len(), 1);
        assert_eq!(cluster.members[0].unit.source_file, "c.md");
        assert_eq!(cluster.members[0].unit.source_index, 0);
        assert!(cluster.members[0].score > 0.99);
        assert!(cluster.canonical.indexed_at < cluster.members[0].unit.indexed_at);

        assert!(cluster.members.iter().all(|m| m.unit.source_file != "b.md"));
    }

    #[tokio::test]
    async fn test_transitivity_scenario() {
        let (cos30, sin30) = (0.866_025_4f32, 0.5f32);
        let (cos60, sin60) = (0.5f32, 0.866_025_4f32);
        let provider = FixedProvider::new(&[
            ("first unit about alpha", vec![1.0, 0.0]),
            ("second unit about beta", vec![cos30, sin30]),
            ("third unit about gamma", vec![cos60, sin60]),
        ]);
        let coll = collection(2).await;
        let analyzer = Analyzer::new(&coll, &provider, AnalyzerOptions::default());

        let docs = [
            Document::new("a.md", "first unit about alpha"),
            Document::new("b.md", "second unit about beta"),
            Document::new("c.md", "third unit about gamma"),
        ];
        let report = analyzer
            .analyze_corpus(&docs, 0.85, &CancellationToken::new())
            .await
            .unwrap();

        // a~c is 0.5, below threshold, yet all three share one cluster.
        assert_eq!(report.clusters.len(), 1);
        let cluster = &report.clusters[0];
        assert_eq!(cluster.canonical.source_file, "a.md");
        let mut sources: Vec<&str> = cluster
            .members
            .iter()
            .map(|m| m.unit.source_file.as_str())
            .collect();
        sources.sort_unstable();
        assert_eq!(sources, vec!["b.md", "c.md"]);
        assert!(cluster.members.iter().all(|m| m.score >= 0.85 && m.score < 0.95));
    }

    #[tokio::test]
    async fn test_single_pass_misses_intra_file_pair_two_pass_finds_it() {
        let text = "Restart the worker after changing the queue settings.\n\nRestart the worker after changing queue settings!";
        let doc = Document::new("dup.md", text);

        let coll = collection(384).await;
        let embedder = hashing();
        let single = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());
        let first_pass = single.analyze_document(&doc, 0.85).await.unwrap();
        // The second unit queries after the first is indexed.
        assert_eq!(first_pass.len(), 1);
        assert_eq!(first_pass[0].query.source_index, 1);
        assert_eq!(first_pass[0].candidate.source_index, 0);

        let coll2 = collection(384).await;
        let two = Analyzer::new(
            &coll2,
            &embedder,
            AnalyzerOptions {
                mode: PassMode::TwoPass,
                ..AnalyzerOptions::default()
            },
        );
        let both = two.analyze_document(&doc, 0.85).await.unwrap();
        assert_eq!(both.len(), 2);
        let report = build_report(&both, "file", 0.85, 0.95);
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.clusters[0].canonical.source_index, 0);
    }

    #[tokio::test]
    async fn test_single_pass_earlier_unit_never_matches_later() {
        let provider = FixedProvider::new(&[
            ("earlier unit in file", vec![1.0, 0.0]),
            ("later unit in file", vec![1.0, 0.0]),
        ]);
        let coll = collection(2).await;
        let analyzer = Analyzer::new(&coll, &provider, AnalyzerOptions::default());
        let matches = analyzer
            .analyze_document(
                &Document::new("f.md", "earlier unit in file\n\nlater unit in file"),
                0.85,
            )
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].query.text, "later unit in file");
        assert_eq!(matches[0].candidate.text, "earlier unit in file");
        assert_eq!(matches[0].query.indexed_at, Some(2));
    }

    #[tokio::test]
    async fn test_corpus_records_embedding_failures() {
        let provider = FixedProvider::new(&[
            ("known unit number one", vec![1.0, 0.0]),
            ("known unit number two", vec![1.0, 0.0]),
        ]);
        let coll = collection(2).await;
        let analyzer = Analyzer::new(&coll, &provider, AnalyzerOptions::default());
        let docs = [
            Document::new("one.md", "known unit number one\n\nunknown unit cannot embed"),
            Document::new("two.md", "known unit number two"),
        ];
        let report = analyzer
            .analyze_corpus(&docs, 0.85, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].source_file, "one.md");
        assert_eq!(report.failures[0].source_index, Some(1));
        assert_eq!(report.failures[0].kind, "embedding");
        assert_eq!(report.units_analyzed, 2);
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(coll.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_analyze_document_surfaces_embedding_error() {
        let provider = FixedProvider::new(&[("known unit number one", vec![1.0, 0.0])]);
        let coll = collection(2).await;
        let analyzer = Analyzer::new(&coll, &provider, AnalyzerOptions::default());
        let err = analyzer
            .analyze_document(
                &Document::new("one.md", "known unit number one\n\nunknown unit cannot embed"),
                0.85,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Embedding(EmbeddingError::Unavailable(_))));
        assert!(coll.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal_for_corpus() {
        let provider = FixedProvider::new(&[("three dims vector unit", vec![1.0, 0.0])]);
        let coll = collection(3).await;
        let analyzer = Analyzer::new(&coll, &provider, AnalyzerOptions::default());
        let result = analyzer
            .analyze_corpus(
                &[Document::new("x.md", "three dims vector unit")],
                0.85,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_corpus_stops_at_unit_boundary() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = analyzer
            .analyze_corpus(&[doc_a(), doc_c()], 0.85, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.units_analyzed, 0);
        assert!(coll.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_units_indexed_so_far() {
        let token = CancellationToken::new();
        let store = Arc::new(CancelAfterUpserts {
            inner: InMemoryStore::new(),
            limit: 5,
            upserts: AtomicUsize::new(0),
            token: token.clone(),
        });
        let coll = Collection::open(store.clone(), "test", 384, StoreLimits::default())
            .await
            .unwrap();
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());

        // a.md and b.md give four units; c.md#0 is the fifth and repeats a.md#1.
        let report = analyzer
            .analyze_corpus(&[doc_a(), doc_b(), doc_c()], 0.85, &token)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.files_analyzed, 2);
        assert_eq!(report.units_analyzed, 5);
        assert_eq!(store.upserts.load(Ordering::SeqCst), 5);
        assert_eq!(coll.len().await.unwrap(), 5);
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.clusters[0].canonical.source_file, "a.md");
        assert_eq!(report.clusters[0].members[0].unit.source_file, "c.md");
    }

    fn repeated_doc() -> Document {
        Document::new(
            "dup.md",
            format!(
                "{}\n\nCharlie covers keyboard shortcuts inside the editor.\n\n{}",
                SHARED, SHARED
            ),
        )
    }

    #[tokio::test]
    async fn test_verbatim_repeat_in_one_file_single_pass() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());

        let matches = analyzer
            .analyze_document(&repeated_doc(), 0.85)
            .await
            .unwrap();
        assert_eq!(coll.len().await.unwrap(), 3);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].query.source_index, 2);
        assert_eq!(matches[0].candidate.source_index, 0);
        assert_ne!(matches[0].query.identity, matches[0].candidate.identity);
        assert!(matches[0].score > 0.99);

        // Both copies keep their own identity on re-analysis.
        analyzer
            .analyze_document(&repeated_doc(), 0.85)
            .await
            .unwrap();
        assert_eq!(coll.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_verbatim_repeat_in_one_file_two_pass() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(
            &coll,
            &embedder,
            AnalyzerOptions {
                mode: PassMode::TwoPass,
                ..AnalyzerOptions::default()
            },
        );

        let matches = analyzer
            .analyze_document(&repeated_doc(), 0.85)
            .await
            .unwrap();
        assert_eq!(coll.len().await.unwrap(), 3);
        assert_eq!(matches.len(), 2);

        let report = build_report(&matches, "file", 0.85, 0.95);
        assert_eq!(report.clusters.len(), 1);
        let cluster = &report.clusters[0];
        assert_eq!(cluster.canonical.source_index, 0);
        assert_eq!(cluster.members.len(), 1);
        assert_eq!(cluster.members[0].unit.source_index, 2);
        assert_eq!(cluster.members[0].action, SuggestedAction::Merge);
    }

    #[tokio::test]
    async fn test_corpus_reports_verbatim_repeat_in_one_file() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());
        let report = analyzer
            .analyze_corpus(&[repeated_doc()], 0.85, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.units_analyzed, 3);
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.clusters[0].canonical.source_index, 0);
        assert_eq!(report.clusters[0].members[0].unit.source_index, 2);
    }

    #[tokio::test]
    async fn test_index_document_stores_without_matching() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());

        assert_eq!(analyzer.index_document(&doc_a()).await.unwrap(), 2);
        assert_eq!(analyzer.index_document(&repeated_doc()).await.unwrap(), 3);
        assert_eq!(coll.len().await.unwrap(), 5);
        // Re-indexing is idempotent.
        assert_eq!(analyzer.index_document(&doc_a()).await.unwrap(), 2);
        assert_eq!(coll.len().await.unwrap(), 5);

        let matches = analyzer.analyze_unit(SHARED, 0.85).await.unwrap();
        let mut sources: Vec<(&str, usize)> = matches
            .iter()
            .map(|m| (m.candidate.source_file.as_str(), m.candidate.source_index))
            .collect();
        sources.sort_unstable();
        assert_eq!(sources, vec![("a.md", 1), ("dup.md", 0), ("dup.md", 2)]);
    }

    #[tokio::test]
    async fn test_embedding_batches_bounded_by_options() {
        let provider = RecordingProvider {
            inner: HashingProvider::new(384),
            batches: Mutex::new(Vec::new()),
        };
        let coll = collection(384).await;
        let analyzer = Analyzer::new(
            &coll,
            &provider,
            AnalyzerOptions {
                batch_size: 2,
                ..AnalyzerOptions::default()
            },
        );
        let doc = Document::new(
            "many.md",
            "Alpha paragraph about caching layers.\n\nBeta paragraph about garden tools.\n\n\
             Gamma paragraph about keyboard layouts.\n\nDelta paragraph about river boats.\n\n\
             Epsilon paragraph about mountain trails.",
        );
        analyzer.analyze_document(&doc, 0.85).await.unwrap();
        assert_eq!(*provider.batches.lock().unwrap(), vec![2, 2, 1]);
        assert_eq!(coll.len().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_analyze_file_decodes_windows_1252() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        let mut bytes = b"Latin bytes caf\xe9 appear inside this sentence.".to_vec();
        bytes.extend_from_slice(b"\n\nSecond paragraph stays perfectly readable.");
        std::fs::write(&path, bytes).unwrap();

        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());
        analyzer.analyze_file(&path, 0.85).await.unwrap();
        assert_eq!(coll.len().await.unwrap(), 2);

        let vector = embedder
            .embed("Latin bytes café appear inside this sentence")
            .await
            .unwrap();
        let stored = coll.query(&vector, 10, 0.0, None).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|s| s.unit.text.contains("café")));
        assert!(stored.iter().all(|s| !s.unit.text.contains('\u{FFFD}')));

        let missing = analyzer
            .analyze_file(dir.path().join("missing.md"), 0.85)
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::Io { .. }));
    }

    #[tokio::test]
    async fn test_scores_within_bounds() {
        let coll = collection(384).await;
        let embedder = hashing();
        let analyzer = Analyzer::new(&coll, &embedder, AnalyzerOptions::default());
        let report = analyzer
            .analyze_corpus(&[doc_a(), doc_b(), doc_c()], 0.0, &CancellationToken::new())
            .await
            .unwrap();
        for cluster in &report.clusters {
            for m in &cluster.members {
                assert!((0.0..=1.0).contains(&m.score));
            }
        }
    }
}
