//! Domain types for managed records and their contributors.
//!
//! A [`ManagedRecord`] is the persisted, aggregated view of one downstream
//! resource: who contributes to it ([`ContributionSource`]), where it lives
//! downstream ([`ExternalId`], scope ids) and how the last sync went
//! ([`RecordStatus`]). All types round-trip through serde; the file-backed
//! store writes them as YAML.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pending;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identity of a managed record inside the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey(pub String);

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Tag selecting the sync strategy that owns a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceType(pub String);

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ResourceType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResourceType {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Downstream identifier: either a pending placeholder or the real id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId(pub String);

impl ExternalId {
    /// True while the downstream resource has not been created yet.
    pub fn is_pending(&self) -> bool {
        pending::is_pending_id(&self.0)
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ExternalId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Optimistic-concurrency token assigned by the store on every write.
///
/// `ConcurrencyToken(0)` marks a record that has never been persisted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConcurrencyToken(pub u64);

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque upstream scoping identifiers (account, zone, ...) handed to the
/// sync strategy untouched.
pub type ScopeIds = BTreeMap<String, String>;

/// The object that contributed a piece of configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl OwnerRef {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle phase of a managed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Phase {
    #[default]
    Pending,
    Syncing,
    Synced,
    Error,
    Failed,
}

impl Phase {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Synced -> Syncing` is legal here; the reconciler only takes it when a
    /// new configuration hash was detected.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Syncing, Synced)
                | (Syncing, Error)
                | (Syncing, Failed)
                | (Synced, Syncing)
                | (Error, Syncing)
                | (Error, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Syncing => write!(f, "Syncing"),
            Phase::Synced => write!(f, "Synced"),
            Phase::Error => write!(f, "Error"),
            Phase::Failed => write!(f, "Failed"),
        }
    }
}

/// Classification bucket of a downstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Permanent,
    Transient,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One contributor's slice of configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionSource {
    pub owner: OwnerRef,
    /// Lower number wins.
    pub priority: i32,
    /// Opaque, kind-specific payload (JSON for the bundled aggregators).
    #[serde(default)]
    pub raw_config: Vec<u8>,
}

impl ContributionSource {
    pub fn new(owner: OwnerRef, priority: i32, raw_config: impl Into<Vec<u8>>) -> Self {
        Self {
            owner,
            priority,
            raw_config: raw_config.into(),
        }
    }
}

/// Observed sync state of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RecordStatus {
    #[serde(default)]
    pub phase: Phase,
    /// Hash of the last successfully synced aggregation; empty if never synced.
    #[serde(default)]
    pub config_hash: String,
    #[serde(default)]
    pub config_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Earliest time a transient retry may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Record generation processed by the last terminal outcome.
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default)]
    pub result_data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_config_snapshot: Option<serde_json::Value>,
}

impl RecordStatus {
    /// Drop every failure/retry field. Called on `Synced` and on `Failed` reset.
    pub fn clear_failure(&mut self) {
        self.retry_count = 0;
        self.failure_reason = None;
        self.error_category = None;
        self.failed_at = None;
        self.next_retry_at = None;
    }
}

/// The canonical per-external-resource state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedRecord {
    pub key: RecordKey,
    pub resource_type: ResourceType,
    pub external_id: ExternalId,
    #[serde(default)]
    pub scope_ids: ScopeIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
    /// Insertion-ordered; at most one entry per owner.
    #[serde(default)]
    pub sources: Vec<ContributionSource>,
    /// Bumped whenever `sources` changes.
    #[serde(default)]
    pub generation: u64,
    /// Teardown guard: the store refuses `delete` while this is set.
    #[serde(default)]
    pub pending_teardown: bool,
    /// A contributor left; downstream must be cut back to the remaining ones.
    #[serde(default)]
    pub teardown_requested: bool,
    /// Explicit request to remove the record and its managed downstream state.
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default)]
    pub token: ConcurrencyToken,
    #[serde(default)]
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedRecord {
    /// A fresh, unpersisted record with no contributors.
    pub fn new(key: RecordKey, resource_type: ResourceType, external_id: ExternalId) -> Self {
        let now = Utc::now();
        Self {
            key,
            resource_type,
            external_id,
            scope_ids: ScopeIds::new(),
            credentials_ref: None,
            sources: Vec::new(),
            generation: 0,
            pending_teardown: false,
            teardown_requested: false,
            deletion_requested: false,
            token: ConcurrencyToken::default(),
            status: RecordStatus::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn source_for(&self, owner: &OwnerRef) -> Option<&ContributionSource> {
        self.sources.iter().find(|s| &s.owner == owner)
    }

    /// Insert or replace the entry for `source.owner`.
    ///
    /// A replaced entry keeps its original position, so registration order
    /// (the equal-priority tie-break) survives re-registration. Returns
    /// `true` if `sources` changed.
    pub fn upsert_source(&mut self, source: ContributionSource) -> bool {
        match self.sources.iter_mut().find(|s| s.owner == source.owner) {
            Some(existing) if *existing == source => false,
            Some(existing) => {
                *existing = source;
                true
            }
            None => {
                self.sources.push(source);
                true
            }
        }
    }

    /// Remove `owner`'s entry. Returns `true` if one was present.
    pub fn remove_source(&mut self, owner: &OwnerRef) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| &s.owner != owner);
        self.sources.len() != before
    }

    /// Whether the next reconcile pass must run teardown instead of sync.
    pub fn needs_teardown(&self) -> bool {
        self.deletion_requested || self.teardown_requested || self.sources.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
