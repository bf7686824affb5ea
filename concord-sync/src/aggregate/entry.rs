//! Merges list-valued configs into one ownership-tagged entry list.

use std::collections::{BTreeMap, HashSet};

use serde::de::DeserializeOwned;
use serde::Serialize;

use concord_core::{ContributionSource, OwnerRef};

use super::{decode_sources, Aggregation};
use crate::error::SyncError;

type ExtractFn<C, E> = dyn Fn(C) -> Vec<E> + Send + Sync;
type DedupFn<E> = dyn Fn(&E) -> String + Send + Sync;

/// One entry stamped with the source it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnedEntry<E> {
    pub entry: E,
    pub owner: OwnerRef,
    pub priority: i32,
}

pub struct EntryAggregator<C, E> {
    extract: Box<ExtractFn<C, E>>,
    dedup_key: Option<Box<DedupFn<E>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryResult<E> {
    /// Precedence order: highest-priority source's entries first.
    pub entries: Vec<OwnedEntry<E>>,
    /// Indexes into `entries`, per contributing owner.
    pub by_owner: BTreeMap<OwnerRef, Vec<usize>>,
    pub source_count: usize,
    pub owners: Vec<OwnerRef>,
}

impl<C, E> EntryAggregator<C, E>
where
    C: DeserializeOwned,
{
    /// `extract` pulls the entry list out of one decoded source config.
    pub fn new(extract: impl Fn(C) -> Vec<E> + Send + Sync + 'static) -> Self {
        Self {
            extract: Box::new(extract),
            dedup_key: None,
        }
    }

    /// Entries with equal keys collapse to the first one seen, which is the
    /// one from the highest-precedence source.
    pub fn with_dedup_key(mut self, key: impl Fn(&E) -> String + Send + Sync + 'static) -> Self {
        self.dedup_key = Some(Box::new(key));
        self
    }

    pub fn aggregate(&self, sources: &[ContributionSource]) -> EntryResult<E> {
        let mut entries = Vec::new();
        let mut by_owner: BTreeMap<OwnerRef, Vec<usize>> = BTreeMap::new();
        let mut owners = Vec::new();
        let mut seen = HashSet::new();

        for (source, config) in decode_sources::<C>(sources) {
            owners.push(source.owner.clone());
            for entry in (self.extract)(config) {
                if let Some(key_fn) = &self.dedup_key {
                    let key = key_fn(&entry);
                    if !seen.insert(key.clone()) {
                        tracing::debug!(owner = %source.owner, key = %key, "dropping duplicate entry");
                        continue;
                    }
                }
                by_owner
                    .entry(source.owner.clone())
                    .or_default()
                    .push(entries.len());
                entries.push(OwnedEntry {
                    entry,
                    owner: source.owner.clone(),
                    priority: source.priority,
                });
            }
        }

        EntryResult {
            entries,
            by_owner,
            source_count: owners.len(),
            owners,
        }
    }
}

impl<E> EntryResult<E> {
    /// Entries contributed by `owner`, in precedence order.
    pub fn get_owner_entries(&self, owner: &OwnerRef) -> Vec<&OwnedEntry<E>> {
        self.by_owner
            .get(owner)
            .map(|idx| idx.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    /// The entry list as it would look without `owner`.
    ///
    /// Entries the owner shadowed through dedup do not reappear; re-aggregate
    /// without the owner's source for that.
    pub fn remove_owner(&self, owner: &OwnerRef) -> Vec<OwnedEntry<E>>
    where
        E: Clone,
    {
        self.entries
            .iter()
            .filter(|e| &e.owner != owner)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E: Serialize> EntryResult<E> {
    pub fn into_aggregation(self) -> Result<Aggregation, SyncError> {
        Ok(Aggregation {
            value: serde_json::to_value(&self.entries)?,
            source_count: self.source_count,
            owners: self.owners,
        })
    }
}
