//! Error types for concord-sync.

use thiserror::Error;

use concord_core::{RecordKey, StoreError};

/// Errors a reconcile pass or a registrar call can surface to its host.
///
/// Downstream failures are not in here: they are classified into the
/// record's status (see [`crate::classify`]) and never propagate.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the record store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Conditional writes kept conflicting.
    #[error("update of {key} still conflicting after {attempts} attempts")]
    RetriesExhausted { key: RecordKey, attempts: u32 },

    /// A typed configuration value could not be turned into JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the record vanished underneath the caller.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Store(err) if err.is_not_found())
    }
}
