//! # semdup CLI
//!
//! Finds semantically redundant passages across a documentation corpus.
//!
//! ```bash
//! semdup --config ./config/semdup.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `semdup init` | Create the SQLite database and the configured collection |
//! | `semdup check "<text>"` | Find stored units similar to a piece of text (no indexing) |
//! | `semdup index <file>...` | Analyse and index files, printing matches |
//! | `semdup add [file]...` | Index files (default: the whole corpus) without reporting |
//! | `semdup report [--output <file>]` | Analyse the whole corpus and print clusters of redundant units |
//! | `semdup reset` | Remove every unit from the collection |
//! | `semdup stats` | Show collections and unit counts |
//!
//! Output goes to stdout; logs go to stderr and honour `RUST_LOG`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use semdup::analyze_cmd::{self, ReportFormat};
use semdup::{config, migrate, stats};

/// Semantic redundancy detection for documentation files.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/semdup.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "semdup",
    about = "Find semantically redundant passages in documentation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/semdup.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and open the configured collection.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Find stored units similar to TEXT without indexing it.
    Check {
        /// Text to compare against the collection.
        text: String,

        /// Minimum similarity score in [0, 1]. Defaults to `[analysis].threshold`.
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Analyse files, report matches against earlier content, and index them.
    Index {
        /// Files to analyse.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Index files without reporting matches. Without paths, indexes the
    /// whole corpus. Prints per-file unit counts and errors.
    Add {
        paths: Vec<PathBuf>,
    },

    /// Analyse every corpus file and print clusters of redundant units.
    ///
    /// Ctrl-C stops at the next unit boundary and prints a partial report.
    Report {
        #[arg(long)]
        threshold: Option<f32>,

        /// Index the whole corpus before querying, so near-duplicates inside
        /// one run are found from both sides.
        #[arg(long)]
        two_pass: bool,

        #[arg(long, value_enum, default_value = "json")]
        format: ReportFormat,

        /// Write the report to this file and print only its summary.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Remove every unit from the configured collection.
    Reset,

    /// Show collections, dimensions, and unit counts.
    Stats,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            let engine = analyze_cmd::open_engine(&cfg).await?;
            engine.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Check { text, threshold } => {
            analyze_cmd::run_check(&cfg, &text, threshold).await?;
        }
        Commands::Index { paths, threshold } => {
            analyze_cmd::run_index(&cfg, &paths, threshold).await?;
        }
        Commands::Add { paths } => {
            analyze_cmd::run_add(&cfg, &paths).await?;
        }
        Commands::Report {
            threshold,
            two_pass,
            format,
            output,
        } => {
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, finishing current unit");
                    token.cancel();
                }
            });
            analyze_cmd::run_report(&cfg, threshold, two_pass, format, output.as_deref(), cancel)
                .await?;
        }
        Commands::Reset => {
            analyze_cmd::run_reset(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
