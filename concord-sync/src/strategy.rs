//! Per-kind collaborator contracts.
//!
//! The engine never talks to a downstream API itself. Each resource type
//! plugs in a [`SyncStrategy`] that knows how to aggregate its sources and
//! how to push or tear down the result; a [`CredentialsResolver`] turns a
//! record's opaque `credentials_ref` into whatever client handle the
//! strategy needs.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use concord_core::{ContributionSource, ExternalId, ResourceType, ScopeIds};

use crate::aggregate::Aggregation;
use crate::classify::DownstreamError;
use crate::error::SyncError;

/// Opaque client handle produced by a [`CredentialsResolver`].
#[derive(Clone)]
pub struct CredentialHandle(Arc<dyn Any + Send + Sync>);

impl CredentialHandle {
    pub fn new<T: Any + Send + Sync>(client: T) -> Self {
        Self(Arc::new(client))
    }

    /// The resolver's concrete client type, if it is `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialHandle(..)")
    }
}

/// What a successful push reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// The real downstream id, when the push created the resource.
    pub external_id: Option<ExternalId>,
    /// Stored verbatim in `status.result_data`.
    pub result_summary: BTreeMap<String, String>,
}

#[async_trait]
pub trait SyncStrategy: Send + Sync {
    /// Merge the record's sources; usually one of the bundled aggregators
    /// followed by `into_aggregation`. An error fails the record permanently.
    fn aggregate(&self, sources: &[ContributionSource]) -> Result<Aggregation, SyncError>;

    async fn push(
        &self,
        scope: &ScopeIds,
        credentials: &CredentialHandle,
        aggregation: &Aggregation,
    ) -> Result<PushOutcome, DownstreamError>;

    /// Cut the downstream resource back to `remaining`, keeping anything
    /// not carrying this operator's ownership marker.
    async fn teardown(
        &self,
        scope: &ScopeIds,
        credentials: &CredentialHandle,
        remaining: &Aggregation,
    ) -> Result<(), DownstreamError>;
}

#[async_trait]
pub trait CredentialsResolver: Send + Sync {
    async fn resolve(
        &self,
        credentials_ref: Option<&str>,
    ) -> Result<CredentialHandle, DownstreamError>;
}

/// Resolver for strategies that need no credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialsResolver for NoCredentials {
    async fn resolve(&self, _: Option<&str>) -> Result<CredentialHandle, DownstreamError> {
        Ok(CredentialHandle::new(()))
    }
}

/// Resource type to strategy lookup, built once at startup.
#[derive(Clone, Default)]
pub struct StrategyTable {
    strategies: HashMap<ResourceType, Arc<dyn SyncStrategy>>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        resource_type: impl Into<ResourceType>,
        strategy: Arc<dyn SyncStrategy>,
    ) -> Self {
        self.insert(resource_type, strategy);
        self
    }

    pub fn insert(
        &mut self,
        resource_type: impl Into<ResourceType>,
        strategy: Arc<dyn SyncStrategy>,
    ) {
        self.strategies.insert(resource_type.into(), strategy);
    }

    pub fn get(&self, resource_type: &ResourceType) -> Option<&Arc<dyn SyncStrategy>> {
        self.strategies.get(resource_type)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
