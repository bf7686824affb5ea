//! Contributor registration: the only writer of `ManagedRecord::sources`.

use concord_core::pending::generate_pending_id;
use concord_core::{
    ContributionSource, ExternalId, ManagedRecord, OwnerRef, RecordKey, ResourceType, ScopeIds,
    StoreError,
};

use crate::error::SyncError;
use crate::updater::Updater;

/// Record-level fields used when the first contributor creates the record.
/// Later registrations only touch `sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTemplate {
    pub resource_type: ResourceType,
    pub scope_ids: ScopeIds,
    pub credentials_ref: Option<String>,
    /// Known downstream id, for adopting a resource that already exists.
    pub external_id: Option<ExternalId>,
}

impl RecordTemplate {
    pub fn new(resource_type: impl Into<ResourceType>) -> Self {
        Self {
            resource_type: resource_type.into(),
            scope_ids: ScopeIds::new(),
            credentials_ref: None,
            external_id: None,
        }
    }

    pub fn scope(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.scope_ids.insert(name.into(), id.into());
        self
    }

    pub fn credentials(mut self, credentials_ref: impl Into<String>) -> Self {
        self.credentials_ref = Some(credentials_ref.into());
        self
    }

    pub fn adopt(mut self, external_id: impl Into<ExternalId>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    fn instantiate(&self, key: &RecordKey, first: ContributionSource) -> ManagedRecord {
        let external_id = self
            .external_id
            .clone()
            .unwrap_or_else(|| generate_pending_id(&first.owner.name));
        let mut record = ManagedRecord::new(key.clone(), self.resource_type.clone(), external_id);
        record.scope_ids = self.scope_ids.clone();
        record.credentials_ref = self.credentials_ref.clone();
        record.sources.push(first);
        record.generation = 1;
        record
    }
}

#[derive(Clone)]
pub struct Registrar {
    updater: Updater,
}

impl Registrar {
    pub fn new(updater: Updater) -> Self {
        Self { updater }
    }

    /// Add or replace `owner`'s contribution, creating the record on first
    /// registration. Bumps `generation` when `sources` actually changes.
    pub async fn register(
        &self,
        key: &RecordKey,
        template: &RecordTemplate,
        owner: OwnerRef,
        priority: i32,
        raw_config: impl Into<Vec<u8>>,
    ) -> Result<ManagedRecord, SyncError> {
        let source = ContributionSource::new(owner, priority, raw_config);
        let store = self.updater.store();

        let mut record = match store.get(key).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => {
                match store.create(template.instantiate(key, source.clone())).await {
                    Ok(created) => {
                        tracing::info!(key = %key, owner = %source.owner, external_id = %created.external_id, "created managed record");
                        return Ok(created);
                    }
                    // Another registrar won the race; join the existing record.
                    Err(StoreError::AlreadyExists { .. }) => store.get(key).await?,
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        if record.source_for(&source.owner) == Some(&source) {
            tracing::debug!(key = %key, owner = %source.owner, "contribution unchanged");
            return Ok(record);
        }

        self.updater
            .update(&mut record, |r| {
                if r.upsert_source(source.clone()) {
                    r.generation += 1;
                }
            })
            .await?;
        tracing::info!(key = %key, owner = %source.owner, generation = record.generation, "registered contribution");
        Ok(record)
    }

    /// Drop `owner`'s contribution and request a teardown of its effect.
    /// Returns `false` if there was nothing to remove.
    pub async fn unregister(&self, key: &RecordKey, owner: &OwnerRef) -> Result<bool, SyncError> {
        let Some(mut record) = self.load(key).await? else {
            return Ok(false);
        };
        if record.source_for(owner).is_none() {
            return Ok(false);
        }

        let mut removed = false;
        self.updater
            .update(&mut record, |r| {
                removed = r.remove_source(owner);
                if removed {
                    r.generation += 1;
                    r.teardown_requested = true;
                }
            })
            .await?;
        if removed {
            tracing::info!(key = %key, owner = %owner, remaining = record.sources.len(), "unregistered contribution");
        }
        Ok(removed)
    }

    /// Ask for the record and everything it manages downstream to be removed,
    /// whatever sources are still registered.
    pub async fn request_deletion(&self, key: &RecordKey) -> Result<bool, SyncError> {
        let Some(mut record) = self.load(key).await? else {
            return Ok(false);
        };
        if record.deletion_requested {
            return Ok(false);
        }
        self.updater
            .update(&mut record, |r| {
                r.deletion_requested = true;
                r.generation += 1;
            })
            .await?;
        tracing::info!(key = %key, "deletion requested");
        Ok(true)
    }

    async fn load(&self, key: &RecordKey) -> Result<Option<ManagedRecord>, SyncError> {
        match self.updater.store().get(key).await {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
