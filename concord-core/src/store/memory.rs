//! In-process store for embedding hosts and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use super::{check_token, notify, ChangeKind, Store, StoreEvent, EVENT_CHANNEL_CAPACITY};
use crate::error::StoreError;
use crate::types::{ConcurrencyToken, ManagedRecord, RecordKey};

/// Map-backed [`Store`]; tokens come from one store-wide counter.
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKey, ManagedRecord>>,
    next_token: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            events,
        }
    }

    fn issue_token(&self) -> ConcurrencyToken {
        ConcurrencyToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<ManagedRecord, StoreError> {
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    async fn create(&self, mut record: ManagedRecord) -> Result<ManagedRecord, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.key) {
            return Err(StoreError::AlreadyExists { key: record.key });
        }
        record.token = self.issue_token();
        records.insert(record.key.clone(), record.clone());
        drop(records);

        notify(&self.events, &record.key, ChangeKind::Created);
        Ok(record)
    }

    async fn update(&self, record: &ManagedRecord) -> Result<ConcurrencyToken, StoreError> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&record.key)
            .ok_or_else(|| StoreError::NotFound {
                key: record.key.clone(),
            })?;
        check_token(record, stored)?;

        let status = std::mem::take(&mut stored.status);
        *stored = record.clone();
        stored.status = status;
        stored.token = self.issue_token();
        stored.updated_at = Utc::now();
        let token = stored.token;
        drop(records);

        notify(&self.events, &record.key, ChangeKind::Spec);
        Ok(token)
    }

    async fn update_status(&self, record: &ManagedRecord) -> Result<ConcurrencyToken, StoreError> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&record.key)
            .ok_or_else(|| StoreError::NotFound {
                key: record.key.clone(),
            })?;
        check_token(record, stored)?;

        stored.status = record.status.clone();
        stored.token = self.issue_token();
        let token = stored.token;
        drop(records);

        notify(&self.events, &record.key, ChangeKind::Status);
        Ok(token)
    }

    async fn delete(&self, record: &ManagedRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let stored = records.get(&record.key).ok_or_else(|| StoreError::NotFound {
            key: record.key.clone(),
        })?;
        check_token(record, stored)?;
        if stored.pending_teardown {
            return Err(StoreError::TeardownPending {
                key: record.key.clone(),
            });
        }
        records.remove(&record.key);
        drop(records);

        notify(&self.events, &record.key, ChangeKind::Deleted);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RecordKey>, StoreError> {
        let mut keys: Vec<RecordKey> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
