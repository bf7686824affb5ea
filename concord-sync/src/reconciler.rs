//! Per-record reconciliation pass.
//!
//! ```text
//! load ─► teardown? ─► finalizer ─► Failed gate ─► debounce gate
//!      ─► aggregate + hash ─► unchanged? ─► Syncing ─► push
//!      ─► Synced | Error (requeue) | Failed
//! ```
//!
//! Downstream failures never escape a pass: they are classified and written
//! to the record's status, and the pass returns the [`Action`] the host
//! should take. Only store errors surface as [`SyncError`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use concord_core::{ErrorCategory, ManagedRecord, Phase, RecordKey, Store};

use crate::aggregate::Aggregation;
use crate::backoff::{self, BackoffPolicy, FailureOutcome};
use crate::classify::DownstreamError;
use crate::config::EngineConfig;
use crate::debounce::Debouncer;
use crate::error::SyncError;
use crate::hash;
use crate::identity::migrate_identity;
use crate::strategy::{CredentialsResolver, PushOutcome, StrategyTable, SyncStrategy};
use crate::updater::Updater;

/// What the host should do with the key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing further until the next change notification.
    Done,
    /// Run the key again after the delay.
    Requeue(Duration),
    /// The record is `Failed`; only a spec change brings it back.
    AwaitChange,
}

pub struct Reconciler {
    updater: Updater,
    strategies: Arc<StrategyTable>,
    credentials: Arc<dyn CredentialsResolver>,
    backoff: BackoffPolicy,
    debouncer: Option<Debouncer<RecordKey>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        strategies: Arc<StrategyTable>,
        credentials: Arc<dyn CredentialsResolver>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            updater: Updater::new(store, config.updater),
            strategies,
            credentials,
            backoff: config.backoff,
            debouncer: None,
        }
    }

    /// Skip passes for keys with a coalesce still pending in `debouncer`.
    pub fn with_debouncer(mut self, debouncer: Debouncer<RecordKey>) -> Self {
        self.debouncer = Some(debouncer);
        self
    }

    pub fn updater(&self) -> &Updater {
        &self.updater
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.updater.store()
    }

    pub fn strategies(&self) -> &StrategyTable {
        &self.strategies
    }

    /// Run one pass for `key`.
    pub async fn reconcile(&self, key: &RecordKey) -> Result<Action, SyncError> {
        match self.run(key).await {
            Err(err) if err.is_not_found() => {
                tracing::debug!(key = %key, "record gone, nothing to reconcile");
                Ok(Action::Done)
            }
            other => other,
        }
    }

    async fn run(&self, key: &RecordKey) -> Result<Action, SyncError> {
        let mut record = self.store().get(key).await?;

        let Some(strategy) = self.strategies.get(&record.resource_type).cloned() else {
            return self.unknown_resource_type(&mut record).await;
        };

        let mut reruns = 0;
        while record.needs_teardown() {
            if let Some(action) = self.teardown(&mut record, strategy.as_ref()).await? {
                return Ok(action);
            }
            reruns += 1;
            if reruns >= self.updater.max_attempts() {
                return Err(SyncError::RetriesExhausted {
                    key: key.clone(),
                    attempts: reruns,
                });
            }
        }

        self.updater.ensure_finalizer(&mut record).await?;

        if record.status.phase == Phase::Failed {
            if !backoff::should_reset(&record) {
                tracing::debug!(key = %key, generation = record.generation, "failed, waiting for a spec change");
                return Ok(Action::AwaitChange);
            }
            self.updater
                .update_status(&mut record, |r| backoff::reset_failed(&mut r.status))
                .await?;
            tracing::info!(key = %key, generation = record.generation, "spec changed since failure, back to pending");
        }

        if self.debouncer.as_ref().is_some_and(|d| d.is_pending(key)) {
            tracing::debug!(key = %key, "coalesce pending, skipping pass");
            return Ok(Action::Done);
        }

        let aggregation = match strategy.aggregate(&record.sources) {
            Ok(aggregation) => aggregation,
            Err(err) => return self.aggregation_failed(&mut record, err).await,
        };
        let current = aggregation.hash();
        if record.status.phase == Phase::Synced
            && !hash::hash_changed(&record.status.config_hash, &current)
        {
            tracing::debug!(key = %key, hash = %current, "unchanged since last sync");
            return Ok(Action::Done);
        }
        if let Some(wait) = retry_not_due(&record) {
            tracing::debug!(key = %key, wait_secs = wait.as_secs(), "retry not due yet");
            return Ok(Action::Requeue(wait));
        }

        self.updater
            .update_status(&mut record, |r| transition(r, Phase::Syncing))
            .await?;

        match self.push(strategy.as_ref(), &record, &aggregation).await {
            Ok(outcome) => self.complete_sync(&mut record, aggregation, current, outcome).await,
            Err(err) => {
                tracing::warn!(key = %key, category = %err.category(), error = %err, "push failed");
                self.record_failure(&mut record, err.category(), err.to_string()).await
            }
        }
    }

    async fn push(
        &self,
        strategy: &dyn SyncStrategy,
        record: &ManagedRecord,
        aggregation: &Aggregation,
    ) -> Result<PushOutcome, DownstreamError> {
        let credentials = self
            .credentials
            .resolve(record.credentials_ref.as_deref())
            .await?;
        strategy
            .push(&record.scope_ids, &credentials, aggregation)
            .await
    }

    async fn complete_sync(
        &self,
        record: &mut ManagedRecord,
        aggregation: Aggregation,
        hash: String,
        outcome: PushOutcome,
    ) -> Result<Action, SyncError> {
        if record.external_id.is_pending() {
            if let Some(real) = outcome.external_id.as_ref().filter(|id| !id.is_pending()) {
                if let Err(err) = migrate_identity(&self.updater, record, real).await {
                    if err.is_not_found() {
                        return Err(err);
                    }
                    tracing::warn!(key = %record.key, error = %err, "identity migration failed");
                    return self
                        .record_failure(
                            record,
                            ErrorCategory::Transient,
                            format!("identity migration failed: {err}"),
                        )
                        .await;
                }
            }
        }

        let generation = record.generation;
        let budget = self.backoff.max_retries;
        let snapshot = aggregation.value;
        let now = Utc::now();
        self.updater
            .update_status(record, |r| {
                transition(r, Phase::Synced);
                let status = &mut r.status;
                status.config_hash = hash.clone();
                status.config_version += 1;
                status.last_sync_time = Some(now);
                status.result_data = outcome.result_summary.clone();
                status.aggregated_config_snapshot = Some(snapshot.clone());
                status.observed_generation = generation;
                status.max_retries = budget;
                status.clear_failure();
            })
            .await?;

        tracing::info!(
            key = %record.key,
            external_id = %record.external_id,
            version = record.status.config_version,
            sources = aggregation.source_count,
            "synced"
        );
        Ok(Action::Done)
    }

    async fn record_failure(
        &self,
        record: &mut ManagedRecord,
        category: ErrorCategory,
        reason: String,
    ) -> Result<Action, SyncError> {
        let policy = self.backoff;
        let generation = record.generation;
        let now = Utc::now();
        let mut outcome = FailureOutcome::Failed;
        self.updater
            .update_status(record, |r| {
                outcome =
                    policy.record_failure(&mut r.status, category, reason.clone(), generation, now);
            })
            .await?;

        match outcome {
            FailureOutcome::Retry(delay) => {
                tracing::warn!(
                    key = %record.key,
                    retry = record.status.retry_count,
                    max = record.status.max_retries,
                    delay_secs = delay.as_secs(),
                    "scheduling retry"
                );
                Ok(Action::Requeue(delay))
            }
            FailureOutcome::Failed => {
                tracing::warn!(key = %record.key, %category, reason = %reason, "record failed");
                Ok(Action::AwaitChange)
            }
        }
    }

    async fn aggregation_failed(
        &self,
        record: &mut ManagedRecord,
        err: SyncError,
    ) -> Result<Action, SyncError> {
        tracing::warn!(key = %record.key, error = %err, "aggregation failed");
        self.record_failure(record, ErrorCategory::Permanent, format!("aggregation failed: {err}"))
            .await
    }

    async fn unknown_resource_type(&self, record: &mut ManagedRecord) -> Result<Action, SyncError> {
        if record.status.phase == Phase::Failed && !backoff::should_reset(record) {
            return Ok(Action::AwaitChange);
        }
        let reason = format!("no sync strategy for resource type {}", record.resource_type);
        tracing::warn!(key = %record.key, resource_type = %record.resource_type, "unknown resource type");
        self.record_failure(record, ErrorCategory::Permanent, reason).await
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Cut downstream back to the remaining sources, or remove it entirely
    /// and delete the record when nothing should remain.
    ///
    /// Every write after the downstream call only applies while `generation`
    /// is still the one torn down. `None` means a contributor changed the
    /// record mid-teardown and `record` has been reloaded for another pass.
    async fn teardown(
        &self,
        record: &mut ManagedRecord,
        strategy: &dyn SyncStrategy,
    ) -> Result<Option<Action>, SyncError> {
        if record.status.phase == Phase::Failed && !backoff::should_reset(record) {
            tracing::debug!(key = %record.key, "teardown failed earlier, waiting for a spec change");
            return Ok(Some(Action::AwaitChange));
        }
        if let Some(wait) = retry_not_due(record) {
            return Ok(Some(Action::Requeue(wait)));
        }

        let generation = record.generation;
        let full = record.deletion_requested || record.sources.is_empty();
        let remaining = if full {
            Aggregation::empty()
        } else {
            match strategy.aggregate(&record.sources) {
                Ok(remaining) => remaining,
                Err(err) => return self.aggregation_failed(record, err).await.map(Some),
            }
        };

        if record.external_id.is_pending() {
            tracing::debug!(key = %record.key, "never created downstream, skipping teardown call");
        } else {
            let torn_down = match self
                .credentials
                .resolve(record.credentials_ref.as_deref())
                .await
            {
                Ok(credentials) => {
                    strategy
                        .teardown(&record.scope_ids, &credentials, &remaining)
                        .await
                }
                Err(err) => Err(err),
            };
            match torn_down {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    tracing::debug!(key = %record.key, "already gone downstream");
                }
                Err(err) => {
                    tracing::warn!(key = %record.key, category = %err.category(), error = %err, "teardown failed");
                    return self
                        .record_failure(record, err.category(), format!("teardown failed: {err}"))
                        .await
                        .map(Some);
                }
            }
        }

        if full {
            return self.release_and_delete(record, generation).await;
        }

        // Downstream now holds exactly the remaining aggregation. A record
        // that was never pushed has nothing to record; the normal pass will
        // create it.
        if !record.external_id.is_pending() {
            let hash = remaining.hash();
            let budget = self.backoff.max_retries;
            let snapshot = remaining.value;
            let now = Utc::now();
            self.updater
                .update_status(record, |r| {
                    if r.generation != generation {
                        return;
                    }
                    let status = &mut r.status;
                    status.phase = Phase::Synced;
                    status.config_hash = hash.clone();
                    status.config_version += 1;
                    status.last_sync_time = Some(now);
                    status.aggregated_config_snapshot = Some(snapshot.clone());
                    status.observed_generation = generation;
                    status.max_retries = budget;
                    status.clear_failure();
                })
                .await?;
        }
        self.updater
            .update(record, |r| {
                if r.generation == generation {
                    r.teardown_requested = false;
                }
            })
            .await?;
        if record.generation != generation {
            tracing::info!(key = %record.key, generation = record.generation, "contributions changed during teardown, going again");
            return Ok(None);
        }
        tracing::info!(key = %record.key, remaining = remaining.source_count, "partial teardown complete");
        Ok(Some(Action::Done))
    }

    async fn release_and_delete(
        &self,
        record: &mut ManagedRecord,
        generation: u64,
    ) -> Result<Option<Action>, SyncError> {
        if record.pending_teardown {
            self.updater
                .update(record, |r| {
                    if r.generation == generation {
                        r.pending_teardown = false;
                    }
                })
                .await?;
        }
        if record.generation != generation {
            tracing::info!(key = %record.key, generation = record.generation, "contributions changed before release, going again");
            self.updater.ensure_finalizer(record).await?;
            return Ok(None);
        }

        match self.store().delete(record).await {
            Ok(()) => {
                tracing::info!(key = %record.key, external_id = %record.external_id, "torn down and deleted");
                Ok(Some(Action::Done))
            }
            Err(err) if err.is_conflict() => {
                *record = self.store().get(&record.key).await?;
                tracing::info!(key = %record.key, generation = record.generation, "record changed before delete, going again");
                if !(record.deletion_requested || record.sources.is_empty()) {
                    self.updater.ensure_finalizer(record).await?;
                }
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Remaining wait when an `Error` record is triggered before its retry is
/// due and nothing changed since the failure.
fn retry_not_due(record: &ManagedRecord) -> Option<Duration> {
    let status = &record.status;
    if status.phase != Phase::Error || record.generation != status.observed_generation {
        return None;
    }
    let remaining = status.next_retry_at? - Utc::now();
    remaining.to_std().ok().filter(|d| !d.is_zero())
}

fn transition(record: &mut ManagedRecord, next: Phase) {
    let current = record.status.phase;
    if current != next && !current.can_transition_to(next) {
        tracing::debug!(key = %record.key, from = %current, to = %next, "unusual phase transition");
    }
    record.status.phase = next;
}
