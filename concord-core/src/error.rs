//! Error types for concord-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ConcurrencyToken, RecordKey};

/// All errors that can arise from record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record is stored under this key.
    #[error("record not found: {key}")]
    NotFound { key: RecordKey },

    /// `create` was called for a key that already has a record.
    #[error("record already exists: {key}")]
    AlreadyExists { key: RecordKey },

    /// Conditional write rejected: the caller's token is stale.
    #[error("conflict writing {key}: expected token {expected}, store has {actual}")]
    Conflict {
        key: RecordKey,
        expected: ConcurrencyToken,
        actual: ConcurrencyToken,
    },

    /// Delete refused while the teardown guard is still set.
    #[error("record {key} still has a pending teardown; delete refused")]
    TeardownPending { key: RecordKey },

    /// The key cannot be used as a storage identifier.
    #[error("invalid record key '{key}': {reason}")]
    InvalidKey { key: RecordKey, reason: &'static str },

    /// Underlying I/O failure, annotated with the path it happened at.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse record at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A blocking store task failed to complete.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for stale-token rejections, the only error the updater retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
