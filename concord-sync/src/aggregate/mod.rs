//! Priority-ordered aggregation of contribution sources.
//!
//! All three aggregators share one pre-step: copy the sources, stable-sort
//! them ascending by priority (lower number wins, registration order breaks
//! ties) and decode each payload. A source whose payload is empty or does not
//! decode is skipped with a warning; it never blocks the others.
//!
//! - [`scalar`] folds typed configs into one merged value
//! - [`entry`] merges list-valued configs into one ownership-tagged list
//! - [`settings`] merges key/value maps, first priority wins per key

pub mod entry;
pub mod scalar;
pub mod settings;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use concord_core::{ContributionSource, OwnerRef};

use crate::hash;

pub use entry::{EntryAggregator, EntryResult, OwnedEntry};
pub use scalar::{ScalarAggregator, ScalarResult};
pub use settings::{Setting, SettingsAggregator, SettingsResult};

/// Kind-neutral view of an aggregation, as handed to a sync strategy and
/// hashed by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    pub value: Value,
    pub source_count: usize,
    pub owners: Vec<OwnerRef>,
}

impl Aggregation {
    /// Nothing left: what teardown pushes when the record goes away.
    pub fn empty() -> Self {
        Self {
            value: Value::Null,
            source_count: 0,
            owners: Vec::new(),
        }
    }

    /// Canonical hash of [`Aggregation::value`].
    pub fn hash(&self) -> String {
        hash::hash_value(&self.value)
    }

    pub fn is_empty(&self) -> bool {
        self.source_count == 0
    }
}

/// Sources in precedence order. `sort_by_key` is stable, so equal
/// priorities keep their registration order.
pub(crate) fn by_priority(sources: &[ContributionSource]) -> Vec<&ContributionSource> {
    let mut ordered: Vec<&ContributionSource> = sources.iter().collect();
    ordered.sort_by_key(|s| s.priority);
    ordered
}

/// Sorted sources paired with their decoded payloads; bad payloads dropped.
pub(crate) fn decode_sources<T: DeserializeOwned>(
    sources: &[ContributionSource],
) -> Vec<(&ContributionSource, T)> {
    by_priority(sources)
        .into_iter()
        .filter_map(|source| decode(source).map(|config| (source, config)))
        .collect()
}

fn decode<T: DeserializeOwned>(source: &ContributionSource) -> Option<T> {
    if source.raw_config.iter().all(u8::is_ascii_whitespace) {
        tracing::warn!(owner = %source.owner, "skipping source with empty config");
        return None;
    }
    match serde_json::from_slice(&source.raw_config) {
        Ok(config) => Some(config),
        Err(err) => {
            tracing::warn!(owner = %source.owner, error = %err, "skipping unparseable source");
            None
        }
    }
}
