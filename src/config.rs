use anyhow::{bail, Context, Result};
use semdup_core::analyzer::{PassMode, DEFAULT_THRESHOLD};
use semdup_core::report::DEFAULT_MERGE_THRESHOLD;
use semdup_core::segment::DEFAULT_MIN_TOKENS;
use semdup_core::store::{RefreshPolicy, StoreLimits};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub segmenter: SegmenterConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub corpus: Option<CorpusConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default = "default_collection_name")]
    pub name: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: default_collection_name(),
        }
    }
}

fn default_collection_name() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmenterConfig {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_tokens: DEFAULT_MIN_TOKENS,
        }
    }
}

fn default_min_tokens() -> usize {
    DEFAULT_MIN_TOKENS
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            cache_capacity: default_cache_capacity(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_cache_capacity() -> usize {
    4096
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub mode: PassMode,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            top_k: default_top_k(),
            mode: PassMode::default(),
        }
    }
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}
fn default_merge_threshold() -> f32 {
    DEFAULT_MERGE_THRESHOLD
}
fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default)]
    pub refresh: RefreshPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_store_timeout_ms(),
            max_retries: default_store_retries(),
            backoff_ms: default_backoff_ms(),
            refresh: RefreshPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn limits(&self) -> StoreLimits {
        StoreLimits {
            timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    5000
}
fn default_store_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// File names (or `prefix*` patterns) that are never analysed.
    #[serde(default = "default_protected_files")]
    pub protected_files: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Skip paths listed in `.gitignore` and `.aiderignore` files.
    #[serde(default = "default_true")]
    pub respect_ignore_files: bool,
}

fn default_true() -> bool {
    true
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

fn default_protected_files() -> Vec<String> {
    ["map.md", "todolist.md", "suivi.md", "demande.md", ".aider*"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EmbeddingConfig {
    /// Vector width for the configured provider.
    pub fn resolved_dims(&self) -> usize {
        match (self.dims, self.provider.as_str()) {
            (Some(d), _) => d,
            (None, "hash") => 384,
            (None, _) => 0,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let analysis = &config.analysis;
    if !(0.0..=1.0).contains(&analysis.threshold) {
        bail!("analysis.threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&analysis.merge_threshold) {
        bail!("analysis.merge_threshold must be in [0.0, 1.0]");
    }
    if analysis.merge_threshold < analysis.threshold {
        bail!("analysis.merge_threshold must be >= analysis.threshold");
    }
    if analysis.top_k == 0 {
        bail!("analysis.top_k must be >= 1");
    }

    if config.segmenter.min_tokens == 0 {
        bail!("segmenter.min_tokens must be >= 1");
    }

    if config.collection.name.trim().is_empty() {
        bail!("collection.name must not be empty");
    }

    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "hash" | "local" => {}
        "openai" | "ollama" => {
            if embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
            if embedding.dims.is_none() {
                bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
            other
        ),
    }
    if embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }
    if embedding.cache_capacity == 0 {
        bail!("embedding.cache_capacity must be >= 1");
    }

    if config.store.timeout_ms == 0 {
        bail!("store.timeout_ms must be > 0");
    }

    Ok(())
}
