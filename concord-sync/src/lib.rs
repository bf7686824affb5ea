//! # concord-sync
//!
//! The reconciliation engine: merges prioritised contributions into one
//! canonical configuration per managed record and keeps the downstream
//! resource in line with it.
//!
//! Wire a [`Reconciler`] with a store, a [`StrategyTable`] and a
//! [`CredentialsResolver`], feed it record keys, and act on the returned
//! [`Action`]. Contributors change records only through the [`Registrar`].

pub mod aggregate;
pub mod backoff;
pub mod classify;
pub mod config;
pub mod debounce;
pub mod error;
pub mod hash;
pub mod identity;
pub mod plan;
pub mod reconciler;
pub mod registrar;
pub mod strategy;
pub mod updater;

pub use aggregate::Aggregation;
pub use backoff::BackoffPolicy;
pub use classify::{DownstreamError, DownstreamErrorKind};
pub use config::EngineConfig;
pub use debounce::Debouncer;
pub use error::SyncError;
pub use plan::{plan, Plan};
pub use reconciler::{Action, Reconciler};
pub use registrar::{RecordTemplate, Registrar};
pub use strategy::{
    CredentialHandle, CredentialsResolver, NoCredentials, PushOutcome, StrategyTable, SyncStrategy,
};
pub use updater::{Updater, UpdaterConfig};
