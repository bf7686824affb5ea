//! Merges key/value maps; each key goes to the highest-precedence source
//! that sets it.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use concord_core::{ContributionSource, OwnerRef};

use super::{decode_sources, Aggregation};
use crate::error::SyncError;

type ExtractFn<C> = dyn Fn(C) -> BTreeMap<String, Value> + Send + Sync;

/// A winning value and the source that set it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setting {
    pub value: Value,
    pub owner: OwnerRef,
    pub priority: i32,
}

pub struct SettingsAggregator<C = BTreeMap<String, Value>> {
    extract: Box<ExtractFn<C>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SettingsResult {
    pub settings: BTreeMap<String, Setting>,
    pub source_count: usize,
    pub owners: Vec<OwnerRef>,
}

impl SettingsAggregator {
    /// Sources whose payload is a flat JSON object.
    pub fn flat() -> Self {
        Self::new(|map| map)
    }
}

impl<C: DeserializeOwned> SettingsAggregator<C> {
    pub fn new(extract: impl Fn(C) -> BTreeMap<String, Value> + Send + Sync + 'static) -> Self {
        Self {
            extract: Box::new(extract),
        }
    }

    pub fn aggregate(&self, sources: &[ContributionSource]) -> SettingsResult {
        let mut result = SettingsResult::default();
        for (source, config) in decode_sources::<C>(sources) {
            result.owners.push(source.owner.clone());
            for (key, value) in (self.extract)(config) {
                result.settings.entry(key).or_insert_with(|| Setting {
                    value,
                    owner: source.owner.clone(),
                    priority: source.priority,
                });
            }
        }
        result.source_count = result.owners.len();
        result
    }
}

impl SettingsResult {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key).map(|s| &s.value)
    }

    pub fn owner_of(&self, key: &str) -> Option<&OwnerRef> {
        self.settings.get(key).map(|s| &s.owner)
    }

    /// Winning values only.
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.settings
            .iter()
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect()
    }

    /// Winning values minus the keys `owner` won.
    pub fn get_settings_without_owner(&self, owner: &OwnerRef) -> BTreeMap<String, Value> {
        self.settings
            .iter()
            .filter(|(_, s)| &s.owner != owner)
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect()
    }

    /// Same signature as the other aggregators; never fails for settings.
    pub fn into_aggregation(self) -> Result<Aggregation, SyncError> {
        Ok(Aggregation {
            value: Value::Object(self.values().into_iter().collect()),
            source_count: self.source_count,
            owners: self.owners,
        })
    }
}
