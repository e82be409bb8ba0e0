//! `check`, `index`, `add`, `report`, and `reset` commands.
//!
//! Each command opens the configured collection, wraps the provider in the
//! embedding cache, and drives the core [`Analyzer`]. Results go to stdout
//! (JSON by default); logs go to stderr.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use semdup_core::analyzer::{Analyzer, AnalyzerOptions, PassMode};
use semdup_core::embedding::{CacheStats, CachedProvider};
use semdup_core::error::Error;
use semdup_core::models::{Document, SimilarityMatch};
use semdup_core::report::{RedundancyReport, ReportSummary, SuggestedAction};
use semdup_core::store::{Collection, VectorStore};

use crate::config::Config;
use crate::sqlite_store::SqliteStore;
use crate::{db, embedding, migrate, scan};

/// Output format for `report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    Json,
    Text,
}

/// An opened collection plus the cached embedder in front of it.
pub struct Engine {
    pub collection: Collection,
    pub embedder: CachedProvider,
    pub options: AnalyzerOptions,
}

impl Engine {
    pub fn analyzer(&self) -> Analyzer<'_> {
        Analyzer::new(&self.collection, &self.embedder, self.options.clone())
    }

    pub async fn close(self) -> CacheStats {
        let stats = self.embedder.cache_stats();
        self.collection.close().await;
        stats
    }
}

pub async fn open_engine(config: &Config) -> Result<Engine> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store: Arc<dyn VectorStore> = Arc::new(SqliteStore::new(pool));

    let provider = embedding::create_provider(&config.embedding)?;
    let dims = provider.dims();
    let collection = Collection::open(store, &config.collection.name, dims, config.store.limits())
        .await
        .with_context(|| {
            format!(
                "Failed to open collection '{}' with {} dims",
                config.collection.name, dims
            )
        })?
        .with_refresh_policy(config.store.refresh);

    tracing::info!(
        collection = %config.collection.name,
        model = provider.model_name(),
        dims,
        "engine ready"
    );

    let embedder = CachedProvider::new(
        provider,
        config.embedding.cache_capacity,
        config.embedding.batch_size,
    );
    let options = AnalyzerOptions {
        top_k: config.analysis.top_k,
        min_tokens: config.segmenter.min_tokens,
        merge_threshold: config.analysis.merge_threshold,
        mode: config.analysis.mode,
        batch_size: config.embedding.batch_size,
    };

    Ok(Engine {
        collection,
        embedder,
        options,
    })
}

/// Query `text` against the collection without indexing it.
pub async fn run_check(config: &Config, text: &str, threshold: Option<f32>) -> Result<()> {
    let engine = open_engine(config).await?;
    let threshold = threshold.unwrap_or(config.analysis.threshold);
    let matches = engine.analyzer().analyze_unit(text, threshold).await?;
    engine.close().await;

    println!("{}", serde_json::to_string_pretty(&matches)?);
    Ok(())
}

#[derive(Serialize)]
struct FileMatches {
    file: String,
    matches: Vec<SimilarityMatch>,
}

/// Analyse and index each file, printing the matches found per file.
pub async fn run_index(config: &Config, paths: &[PathBuf], threshold: Option<f32>) -> Result<()> {
    let engine = open_engine(config).await?;
    let threshold = threshold.unwrap_or(config.analysis.threshold);
    let analyzer = engine.analyzer();

    let mut results = Vec::with_capacity(paths.len());
    for path in paths {
        let matches = match corpus_key(config, path) {
            Some(key) => {
                let doc = Document::new(key, scan::read_text(path)?);
                analyzer.analyze_document(&doc, threshold).await?
            }
            None => analyzer
                .analyze_file(path, threshold)
                .await
                .with_context(|| format!("Failed to analyze {}", path.display()))?,
        };
        results.push(FileMatches {
            file: path.display().to_string(),
            matches,
        });
    }
    let stats = engine.close().await;
    tracing::debug!(hits = stats.hits, misses = stats.misses, "embedding cache");

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

/// Source key for a file inside the corpus root, matching what `report` uses.
fn corpus_key(config: &Config, path: &Path) -> Option<String> {
    let root = config.corpus.as_ref()?.root.canonicalize().ok()?;
    let file = path.canonicalize().ok()?;
    let relative = file.strip_prefix(&root).ok()?;
    Some(relative.to_string_lossy().replace('\\', "/"))
}

#[derive(Debug, Serialize)]
pub struct FileAdded {
    pub file: String,
    pub units: usize,
}

#[derive(Debug, Serialize)]
pub struct FileError {
    pub file: String,
    pub error: String,
}

/// Outcome of `add`: what was indexed and which files failed.
#[derive(Debug, Default, Serialize)]
pub struct AddStats {
    pub total_files: usize,
    pub total_units: usize,
    pub files: Vec<FileAdded>,
    pub errors: Vec<FileError>,
}

/// Index files (or the whole corpus when `paths` is empty) without reporting
/// matches. A file that fails is recorded and the rest are still indexed.
pub async fn run_add(config: &Config, paths: &[PathBuf]) -> Result<()> {
    let mut stats = AddStats::default();
    let documents = if paths.is_empty() {
        let corpus = config
            .corpus
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("[corpus] section is required to add without paths"))?;
        scan::scan_corpus(corpus)?
    } else {
        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let key = corpus_key(config, path).unwrap_or_else(|| path.display().to_string());
            match scan::read_text(path) {
                Ok(body) => documents.push(Document::new(key, body)),
                Err(err) => stats.errors.push(FileError {
                    file: key,
                    error: format!("{:#}", err),
                }),
            }
        }
        documents
    };

    let engine = open_engine(config).await?;
    add_documents(&engine.analyzer(), &documents, &mut stats).await?;
    engine.close().await;

    if !stats.errors.is_empty() {
        tracing::warn!(errors = stats.errors.len(), "some files could not be indexed");
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn add_documents(
    analyzer: &Analyzer<'_>,
    documents: &[Document],
    stats: &mut AddStats,
) -> Result<()> {
    for doc in documents {
        match analyzer.index_document(doc).await {
            Ok(units) => {
                stats.total_files += 1;
                stats.total_units += units;
                stats.files.push(FileAdded {
                    file: doc.source.clone(),
                    units,
                });
            }
            Err(err @ Error::DimensionMismatch { .. }) => return Err(err.into()),
            Err(err) => {
                tracing::warn!(file = %doc.source, error = %err, "failed to index file");
                stats.errors.push(FileError {
                    file: doc.source.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Remove every unit from the configured collection.
pub async fn run_reset(config: &Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let removed = engine.collection.clear().await?;
    let name = engine.collection.name().to_string();
    engine.close().await;
    println!("Collection '{}' reset ({} units removed).", name, removed);
    Ok(())
}

/// Scan the corpus, analyse every file, and print the clustered report.
///
/// With `output`, the report is written to that file instead and only its
/// summary is printed.
pub async fn run_report(
    config: &Config,
    threshold: Option<f32>,
    two_pass: bool,
    format: ReportFormat,
    output: Option<&Path>,
    cancel: CancellationToken,
) -> Result<()> {
    let corpus = config
        .corpus
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("[corpus] section is required for report"))?;
    let documents = scan::scan_corpus(corpus)?;

    let mut engine = open_engine(config).await?;
    if two_pass {
        engine.options.mode = PassMode::TwoPass;
    }
    let threshold = threshold.unwrap_or(config.analysis.threshold);
    let report = engine
        .analyzer()
        .analyze_corpus(&documents, threshold, &cancel)
        .await?;
    let stats = engine.close().await;
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        entries = stats.entries,
        "embedding cache"
    );

    let rendered = match format {
        ReportFormat::Json => format!("{}\n", serde_json::to_string_pretty(&report)?),
        ReportFormat::Text => render_text(&report),
    };
    match output {
        None => print!("{}", rendered),
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            let summary = report.summary();
            match format {
                ReportFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&WrittenReport {
                        output: path.display().to_string(),
                        summary,
                    })?
                ),
                ReportFormat::Text => {
                    print!("{}", render_summary(&summary));
                    println!("Report saved to {}", path.display());
                }
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct WrittenReport {
    output: String,
    #[serde(flatten)]
    summary: ReportSummary,
}

pub fn render_summary(summary: &ReportSummary) -> String {
    let mut out = String::from("Analysis summary:\n");
    out.push_str(&format!("  files analyzed:  {}\n", summary.files_analyzed));
    out.push_str(&format!("  units analyzed:  {}\n", summary.units_analyzed));
    out.push_str(&format!("  redundant units: {}\n", summary.redundant_units));
    out.push_str(&format!("  clusters:        {}\n", summary.clusters));
    if summary.failures > 0 {
        out.push_str(&format!("  failures:        {}\n", summary.failures));
    }
    if summary.cancelled {
        out.push_str("  (cancelled: partial results)\n");
    }
    out
}

pub fn render_text(report: &RedundancyReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Redundancy report {}\n", report.run_id));
    out.push_str(&format!(
        "  generated {}, threshold {:.2}, merge at {:.2}\n",
        report.generated_at.to_rfc3339(),
        report.threshold,
        report.merge_threshold
    ));
    out.push_str(&format!(
        "  {} files, {} units analyzed, {} clusters, {} redundant units\n",
        report.files_analyzed,
        report.units_analyzed,
        report.clusters.len(),
        report.redundant_units()
    ));
    if report.cancelled {
        out.push_str("  (cancelled: partial results)\n");
    }

    for (n, cluster) in report.clusters.iter().enumerate() {
        out.push_str(&format!(
            "\nCluster {}: keep {}#{}\n    {}\n",
            n + 1,
            cluster.canonical.source_file,
            cluster.canonical.source_index,
            excerpt(&cluster.canonical.text)
        ));
        for member in &cluster.members {
            let action = match member.action {
                SuggestedAction::Merge => "merge",
                SuggestedAction::Review => "review",
            };
            out.push_str(&format!(
                "  [{} {:.3}] {}#{}\n    {}\n",
                action,
                member.score,
                member.unit.source_file,
                member.unit.source_index,
                excerpt(&member.unit.text)
            ));
        }
    }

    if !report.failures.is_empty() {
        out.push_str("\nFailures:\n");
        for failure in &report.failures {
            let at = failure
                .source_index
                .map(|i| format!("#{}", i))
                .unwrap_or_default();
            out.push_str(&format!(
                "  {}{} ({}): {}\n",
                failure.source_file, at, failure.kind, failure.message
            ));
        }
    }
    out
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 100;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}
