//! # semdup
//!
//! Semantic redundancy detection for documentation and knowledge files.
//!
//! The engine itself lives in `semdup-core`; this crate supplies the
//! pieces that touch the outside world and wires them into a CLI.
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │ Corpus scan │──▶│ Segment +    │──▶│ SQLite      │──▶│ Report   │
//! │ globs       │   │ embed (LRU)  │   │ vector store│   │ clusters │
//! └─────────────┘   └──────────────┘   └─────────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite-backed vector store |
//! | [`embedding`] | Hash, OpenAI, Ollama, and local providers |
//! | [`scan`] | Corpus discovery |
//! | [`analyze_cmd`] | `check`, `index`, and `report` commands |
//! | [`stats`] | Collection statistics |

pub mod analyze_cmd;
pub mod config;
pub mod db;
pub mod embedding;
pub mod migrate;
pub mod scan;
pub mod sqlite_store;
pub mod stats;
