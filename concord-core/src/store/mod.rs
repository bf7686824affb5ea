//! Record store contract.
//!
//! Every mutation of a [`ManagedRecord`] goes through a conditional write:
//! the store compares the record's [`ConcurrencyToken`] with the one it holds
//! and rejects stale writers with [`StoreError::Conflict`]. Successful writes
//! assign a fresh token, which the store returns.
//!
//! `update` writes everything except `status`; `update_status` writes only
//! `status`. Both are conditional on the same token.

pub mod file;
mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::types::{ConcurrencyToken, ManagedRecord, RecordKey};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Capacity of the change-notification channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What part of a record changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Spec,
    Status,
    Deleted,
}

/// Change notification keyed by record identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: RecordKey,
    pub change: ChangeKind,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Returns [`StoreError::NotFound`] when absent.
    async fn get(&self, key: &RecordKey) -> Result<ManagedRecord, StoreError>;

    /// Persist a new record; [`StoreError::AlreadyExists`] if the key is taken.
    async fn create(&self, record: ManagedRecord) -> Result<ManagedRecord, StoreError>;

    /// Conditional write of everything but `status`.
    async fn update(&self, record: &ManagedRecord) -> Result<ConcurrencyToken, StoreError>;

    /// Conditional write of `status` only.
    async fn update_status(&self, record: &ManagedRecord) -> Result<ConcurrencyToken, StoreError>;

    /// Conditional on the token like `update`. Refused with
    /// [`StoreError::TeardownPending`] while `pending_teardown` is set.
    async fn delete(&self, record: &ManagedRecord) -> Result<(), StoreError>;

    /// All keys, sorted.
    async fn list(&self) -> Result<Vec<RecordKey>, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

pub(crate) fn notify(events: &broadcast::Sender<StoreEvent>, key: &RecordKey, change: ChangeKind) {
    // No receivers is fine: nobody is watching yet.
    let _ = events.send(StoreEvent {
        key: key.clone(),
        change,
    });
}

pub(crate) fn check_token(
    record: &ManagedRecord,
    stored: &ManagedRecord,
) -> Result<(), StoreError> {
    if record.token != stored.token {
        return Err(StoreError::Conflict {
            key: record.key.clone(),
            expected: record.token,
            actual: stored.token,
        });
    }
    Ok(())
}
