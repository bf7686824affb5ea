//! Read-modify-conditional-write with conflict retry.
//!
//! Each attempt applies `mutate` to the caller's copy and issues a
//! conditional write. A conflict means somebody else wrote first: wait
//! `conflict_delay`, re-read, and try again. Any other error returns at
//! once. After a successful write the record is re-read so the caller holds
//! the post-write token, and a second write in the same pass does not
//! conflict with the first.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use concord_core::{ManagedRecord, Store};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub max_retries: u32,
    pub conflict_delay_ms: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            conflict_delay_ms: 100,
        }
    }
}

impl UpdaterConfig {
    pub fn conflict_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_delay_ms)
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Spec,
    Status,
}

#[derive(Clone)]
pub struct Updater {
    store: Arc<dyn Store>,
    config: UpdaterConfig,
}

impl Updater {
    pub fn new(store: Arc<dyn Store>, config: UpdaterConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Write attempts per call; at least one whatever the config says.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.max(1)
    }

    /// Mutate and write everything but `status`.
    pub async fn update<F>(&self, record: &mut ManagedRecord, mutate: F) -> Result<(), SyncError>
    where
        F: FnMut(&mut ManagedRecord) + Send,
    {
        self.write_with_retry(record, mutate, Target::Spec).await
    }

    /// Mutate and write `status` only.
    pub async fn update_status<F>(
        &self,
        record: &mut ManagedRecord,
        mutate: F,
    ) -> Result<(), SyncError>
    where
        F: FnMut(&mut ManagedRecord) + Send,
    {
        self.write_with_retry(record, mutate, Target::Status).await
    }

    /// Set the teardown guard. No write if it is already set.
    pub async fn ensure_finalizer(&self, record: &mut ManagedRecord) -> Result<(), SyncError> {
        if record.pending_teardown {
            return Ok(());
        }
        self.update(record, |r| r.pending_teardown = true).await?;
        tracing::debug!(key = %record.key, "finalizer added");
        Ok(())
    }

    /// Release the teardown guard so the store permits `delete`.
    pub async fn remove_finalizer(&self, record: &mut ManagedRecord) -> Result<(), SyncError> {
        if !record.pending_teardown {
            return Ok(());
        }
        self.update(record, |r| r.pending_teardown = false).await?;
        tracing::debug!(key = %record.key, "finalizer removed");
        Ok(())
    }

    async fn write_with_retry<F>(
        &self,
        record: &mut ManagedRecord,
        mut mutate: F,
        target: Target,
    ) -> Result<(), SyncError>
    where
        F: FnMut(&mut ManagedRecord) + Send,
    {
        let attempts = self.max_attempts();
        for attempt in 1..=attempts {
            mutate(record);
            let written = match target {
                Target::Spec => self.store.update(record).await,
                Target::Status => self.store.update_status(record).await,
            };
            match written {
                Ok(_) => {
                    *record = self.store.get(&record.key).await?;
                    return Ok(());
                }
                Err(err) if err.is_conflict() => {
                    tracing::debug!(key = %record.key, attempt, ?target, "write conflict, re-reading");
                    tokio::time::sleep(self.config.conflict_delay()).await;
                    *record = self.store.get(&record.key).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        tracing::warn!(key = %record.key, attempts, "giving up on conflicting writes");
        Err(SyncError::RetriesExhausted {
            key: record.key.clone(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concord_core::{
        ConcurrencyToken, ExternalId, MemoryStore, Phase, RecordKey, ResourceType, StoreError,
        StoreEvent,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    /// Rejects the first `conflicts` conditional writes.
    struct Contended {
        inner: MemoryStore,
        conflicts: AtomicU32,
        other_error: bool,
    }

    impl Contended {
        fn new(conflicts: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                conflicts: AtomicU32::new(conflicts),
                other_error: false,
            }
        }

        fn gate(&self, record: &ManagedRecord) -> Result<(), StoreError> {
            if self.other_error {
                return Err(StoreError::Backend("disk on fire".into()));
            }
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict {
                    key: record.key.clone(),
                    expected: record.token,
                    actual: ConcurrencyToken(u64::MAX),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for Contended {
        async fn get(&self, key: &RecordKey) -> Result<ManagedRecord, StoreError> {
            self.inner.get(key).await
        }
        async fn create(&self, record: ManagedRecord) -> Result<ManagedRecord, StoreError> {
            self.inner.create(record).await
        }
        async fn update(&self, record: &ManagedRecord) -> Result<ConcurrencyToken, StoreError> {
            self.gate(record)?;
            self.inner.update(record).await
        }
        async fn update_status(
            &self,
            record: &ManagedRecord,
        ) -> Result<ConcurrencyToken, StoreError> {
            self.gate(record)?;
            self.inner.update_status(record).await
        }
        async fn delete(&self, record: &ManagedRecord) -> Result<(), StoreError> {
            self.inner.delete(record).await
        }
        async fn list(&self) -> Result<Vec<RecordKey>, StoreError> {
            self.inner.list().await
        }
        fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
            self.inner.subscribe()
        }
    }

    async fn seeded(store: &Contended) -> ManagedRecord {
        store
            .inner
            .create(ManagedRecord::new(
                RecordKey::from("r"),
                ResourceType::from("kind"),
                ExternalId::from("pending-r"),
            ))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn two_conflicts_then_success_applies_once() {
        let store = Arc::new(Contended::new(2));
        let mut record = seeded(&store).await;
        let updater = Updater::new(store.clone(), UpdaterConfig::default());

        let mut calls = 0;
        updater
            .update(&mut record, |r| {
                calls += 1;
                r.generation += 1;
            })
            .await
            .unwrap();

        assert_eq!(calls, 3);
        let stored = store.get(&record.key).await.unwrap();
        assert_eq!(stored.generation, 1, "mutation applied exactly once");
        assert_eq!(record.token, stored.token);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_retries_names_the_count() {
        let store = Arc::new(Contended::new(u32::MAX));
        let mut record = seeded(&store).await;
        let config = UpdaterConfig {
            max_retries: 3,
            conflict_delay_ms: 10,
        };
        let updater = Updater::new(store, config);

        let err = updater.update(&mut record, |_| {}).await.unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_still_attempts_once() {
        let store = Arc::new(Contended::new(0));
        let mut record = seeded(&store).await;
        let config = UpdaterConfig {
            max_retries: 0,
            conflict_delay_ms: 10,
        };
        let updater = Updater::new(store.clone(), config);
        assert_eq!(updater.max_attempts(), 1);

        updater
            .update(&mut record, |r| r.generation = 4)
            .await
            .expect("single attempt succeeds");
        assert_eq!(store.get(&record.key).await.unwrap().generation, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_conflict_errors_return_immediately() {
        let mut contended = Contended::new(0);
        contended.other_error = true;
        let store = Arc::new(contended);
        let mut record = seeded(&store).await;
        let updater = Updater::new(store, UpdaterConfig::default());

        let mut calls = 0;
        let err = updater
            .update(&mut record, |_| calls += 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Backend(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_variant_writes_status_only() {
        let store = Arc::new(Contended::new(1));
        let mut record = seeded(&store).await;
        let updater = Updater::new(store.clone(), UpdaterConfig::default());

        updater
            .update_status(&mut record, |r| {
                r.status.phase = Phase::Syncing;
                r.generation = 99;
            })
            .await
            .unwrap();

        let stored = store.get(&record.key).await.unwrap();
        assert_eq!(stored.status.phase, Phase::Syncing);
        assert_eq!(stored.generation, 0);
        assert_eq!(record.generation, 0, "caller copy re-read after write");
    }

    #[tokio::test]
    async fn finalizer_is_idempotent() {
        let store = Arc::new(Contended::new(0));
        let mut record = seeded(&store).await;
        let updater = Updater::new(store.clone(), UpdaterConfig::default());

        updater.ensure_finalizer(&mut record).await.unwrap();
        let token = record.token;
        updater.ensure_finalizer(&mut record).await.unwrap();
        assert_eq!(record.token, token, "second ensure must not write");
        assert!(store.get(&record.key).await.unwrap().pending_teardown);

        updater.remove_finalizer(&mut record).await.unwrap();
        assert!(!store.get(&record.key).await.unwrap().pending_teardown);
    }
}
