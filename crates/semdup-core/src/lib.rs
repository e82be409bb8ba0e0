//! # semdup core
//!
//! Storage-agnostic logic for semantic redundancy detection: segmentation,
//! the embedding trait and cache, the vector store abstraction with an
//! in-memory backend, similarity analysis, and report clustering.
//!
//! Persistent backends and network embedding providers live in the `semdup`
//! application crate and plug in through [`store::VectorStore`] and
//! [`embedding::EmbeddingProvider`].

pub mod analyzer;
pub mod embedding;
pub mod error;
pub mod models;
pub mod report;
pub mod segment;
pub mod store;

pub use error::{Error, Result};
