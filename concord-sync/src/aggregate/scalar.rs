//! Priority-ordered fold of typed configs into one merged value.

use serde::de::DeserializeOwned;
use serde::Serialize;

use concord_core::{ContributionSource, OwnerRef};

use super::{decode_sources, Aggregation};
use crate::error::SyncError;

type MergeFn<T> = dyn Fn(T, T, &OwnerRef, i32) -> T + Send + Sync;
type FinalizeFn<T> = dyn Fn(T) -> T + Send + Sync;

/// Folds every decodable source, highest precedence first, into
/// `T::default()` with a caller-supplied merge function.
pub struct ScalarAggregator<T> {
    merge: Box<MergeFn<T>>,
    finalize: Option<Box<FinalizeFn<T>>>,
}

/// Merged value plus who contributed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarResult<T> {
    pub value: T,
    pub source_count: usize,
    pub owners: Vec<OwnerRef>,
}

impl<T> ScalarAggregator<T>
where
    T: DeserializeOwned + Default,
{
    /// `merge(aggregated, decoded, owner, priority) -> aggregated`
    pub fn new(merge: impl Fn(T, T, &OwnerRef, i32) -> T + Send + Sync + 'static) -> Self {
        Self {
            merge: Box::new(merge),
            finalize: None,
        }
    }

    /// Run once over the merged value, e.g. to sort or append a catch-all.
    pub fn with_finalize(mut self, finalize: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.finalize = Some(Box::new(finalize));
        self
    }

    pub fn aggregate(&self, sources: &[ContributionSource]) -> ScalarResult<T> {
        let mut value = T::default();
        let mut owners = Vec::new();
        for (source, decoded) in decode_sources::<T>(sources) {
            value = (self.merge)(value, decoded, &source.owner, source.priority);
            owners.push(source.owner.clone());
        }
        if let Some(finalize) = &self.finalize {
            value = finalize(value);
        }
        ScalarResult {
            value,
            source_count: owners.len(),
            owners,
        }
    }
}

impl<T: Serialize> ScalarResult<T> {
    pub fn into_aggregation(self) -> Result<Aggregation, SyncError> {
        Ok(Aggregation {
            value: serde_json::to_value(&self.value)?,
            source_count: self.source_count,
            owners: self.owners,
        })
    }
}
