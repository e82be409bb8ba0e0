//! Error taxonomy for the redundancy engine.
//!
//! Errors fall into three classes:
//!
//! | Class | Variants | Policy |
//! |-------|----------|--------|
//! | Per-unit | [`Error::Embedding`] | Not retried; the unit is skipped |
//! | Transient | [`Error::StoreUnavailable`], [`Error::StoreTimeout`] | Retried with bounded backoff |
//! | Fatal | [`Error::DimensionMismatch`], [`Error::InvalidThreshold`] | Surfaced immediately |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to turn text into a vector.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingError {
    #[error("cannot embed empty text")]
    EmptyText,

    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    #[error("embedding backend returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

/// Unified error type for store, embedding, and analysis operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store operation `{operation}` timed out after {elapsed:?}")]
    StoreTimeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("vector dimension mismatch: collection expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::StoreTimeout { .. })
    }

    /// Short machine-readable kind, used in report failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Embedding(_) => "embedding",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::StoreTimeout { .. } => "store_timeout",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::InvalidThreshold(_) => "invalid_threshold",
            Error::Io { .. } => "io",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reject thresholds outside `[0, 1]` (NaN included).
pub fn check_threshold(threshold: f32) -> Result<f32> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(Error::InvalidThreshold(threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::StoreUnavailable("locked".into()).is_transient());
        assert!(Error::StoreTimeout {
            operation: "query",
            elapsed: Duration::from_millis(10),
        }
        .is_transient());
        assert!(!Error::DimensionMismatch {
            expected: 3,
            actual: 2
        }
        .is_transient());
        assert!(!Error::InvalidThreshold(1.5).is_transient());
        assert!(!Error::Embedding(EmbeddingError::EmptyText).is_transient());
    }

    #[test]
    fn test_check_threshold() {
        assert!(check_threshold(0.0).is_ok());
        assert!(check_threshold(1.0).is_ok());
        assert!(matches!(
            check_threshold(1.01),
            Err(Error::InvalidThreshold(_))
        ));
        assert!(matches!(
            check_threshold(-0.1),
            Err(Error::InvalidThreshold(_))
        ));
        assert!(matches!(
            check_threshold(f32::NAN),
            Err(Error::InvalidThreshold(_))
        ));
    }
}
