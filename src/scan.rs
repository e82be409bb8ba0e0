//! Corpus discovery: walk the configured root and load matching files.
//!
//! Paths listed in `.gitignore` or `.aiderignore` files are skipped unless
//! `respect_ignore_files` is off. The root does not need to be a git
//! repository for this to apply.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use semdup_core::models::Document;
use semdup_core::segment::decode_text;
use std::path::Path;

use crate::config::CorpusConfig;

/// Load every included, non-protected file under `corpus.root`.
///
/// Documents are keyed by their path relative to the root and returned in
/// path order so repeated runs index units in the same sequence.
pub fn scan_corpus(corpus: &CorpusConfig) -> Result<Vec<Document>> {
    let root = &corpus.root;
    if !root.exists() {
        bail!("Corpus root does not exist: {}", root.display());
    }

    let include_set = build_globset(&corpus.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(corpus.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;
    let protected_set = build_globset(&corpus.protected_files)?;

    let mut documents = Vec::new();

    let respect = corpus.respect_ignore_files;
    let mut builder = WalkBuilder::new(root);
    builder
        .follow_links(corpus.follow_symlinks)
        .hidden(false)
        .ignore(respect)
        .git_ignore(respect)
        .git_global(false)
        .git_exclude(false)
        .require_git(false);
    if respect {
        builder.add_custom_ignore_filename(".aiderignore");
    }

    for entry in builder.build() {
        let entry = entry?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        if is_protected(&protected_set, path) {
            tracing::debug!(path = %rel_str, "skipping protected file");
            continue;
        }

        let body = read_text(path)?;
        documents.push(Document::new(rel_str, body));
    }

    documents.sort_by(|a, b| a.source.cmp(&b.source));
    tracing::info!(root = %root.display(), files = documents.len(), "corpus scanned");
    Ok(documents)
}

fn is_protected(protected: &GlobSet, path: &Path) -> bool {
    path.file_name()
        .map(|name| protected.is_match(Path::new(name)))
        .unwrap_or(false)
}

/// Read a file as text and normalize line endings. Files that are not valid
/// UTF-8 are decoded as Windows-1252.
pub fn read_text(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = decode_text(&bytes);
    Ok(text.replace("\r\n", "\n").replace('\r', "\n"))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
