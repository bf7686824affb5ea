//! Concord core library: managed-record domain types, the record store
//! contract, ownership markers and pending identities.
//!
//! - [`types`]: newtypes, [`ManagedRecord`] and its status
//! - [`store`]: the conditional-write [`Store`] trait, [`MemoryStore`], [`FileStore`]
//! - [`marker`]: `[managed-by:…]` tags for downstream free-text fields
//! - [`pending`]: `pending-<name>` placeholder ids
//! - [`error`]: [`StoreError`]

pub mod error;
pub mod marker;
pub mod pending;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use marker::OwnershipMarker;
pub use store::{ChangeKind, FileStore, MemoryStore, Store, StoreEvent};
pub use types::{
    ConcurrencyToken, ContributionSource, ErrorCategory, ExternalId, ManagedRecord, OwnerRef,
    Phase, RecordKey, RecordStatus, ResourceType, ScopeIds,
};
