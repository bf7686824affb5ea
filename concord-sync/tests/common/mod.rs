//! Shared fixtures: a scriptable strategy over flat settings and a wired-up
//! engine on a memory store.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use concord_core::{ContributionSource, MemoryStore, OwnerRef, RecordKey, ScopeIds, Store};
use concord_sync::aggregate::SettingsAggregator;
use concord_sync::{
    Aggregation, CredentialHandle, DownstreamError, EngineConfig, NoCredentials, PushOutcome,
    Reconciler, RecordTemplate, Registrar, StrategyTable, SyncError, SyncStrategy, Updater,
};

pub const KIND: &str = "zone-settings";

/// Records every call; replies from queued results, else succeeds.
#[derive(Default)]
pub struct FakeStrategy {
    pub pushes: Mutex<Vec<Aggregation>>,
    pub teardowns: Mutex<Vec<Aggregation>>,
    pub push_results: Mutex<VecDeque<Result<PushOutcome, DownstreamError>>>,
    pub teardown_results: Mutex<VecDeque<Result<(), DownstreamError>>>,
}

impl FakeStrategy {
    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.lock().unwrap().len()
    }

    pub fn last_push(&self) -> Option<Aggregation> {
        self.pushes.lock().unwrap().last().cloned()
    }

    pub fn last_teardown(&self) -> Option<Aggregation> {
        self.teardowns.lock().unwrap().last().cloned()
    }

    pub fn fail_next_push(&self, err: DownstreamError) {
        self.push_results.lock().unwrap().push_back(Err(err));
    }

    pub fn fail_next_teardown(&self, err: DownstreamError) {
        self.teardown_results.lock().unwrap().push_back(Err(err));
    }
}

#[async_trait]
impl SyncStrategy for FakeStrategy {
    fn aggregate(&self, sources: &[ContributionSource]) -> Result<Aggregation, SyncError> {
        SettingsAggregator::flat().aggregate(sources).into_aggregation()
    }

    async fn push(
        &self,
        _scope: &ScopeIds,
        _credentials: &CredentialHandle,
        aggregation: &Aggregation,
    ) -> Result<PushOutcome, DownstreamError> {
        self.pushes.lock().unwrap().push(aggregation.clone());
        let scripted = self.push_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PushOutcome {
                external_id: Some("ext-1".into()),
                result_summary: BTreeMap::from([("zoneId".to_string(), "ext-1".to_string())]),
            })
        })
    }

    async fn teardown(
        &self,
        _scope: &ScopeIds,
        _credentials: &CredentialHandle,
        remaining: &Aggregation,
    ) -> Result<(), DownstreamError> {
        self.teardowns.lock().unwrap().push(remaining.clone());
        let scripted = self.teardown_results.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))
    }
}

pub struct Engine {
    pub store: Arc<dyn Store>,
    pub strategy: Arc<FakeStrategy>,
    pub reconciler: Reconciler,
    pub registrar: Registrar,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn Store>) -> Self {
        let config = EngineConfig::default();
        let strategy = Arc::new(FakeStrategy::default());
        let table = StrategyTable::new().with(KIND, strategy.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(table),
            Arc::new(NoCredentials),
            &config,
        );
        let registrar = Registrar::new(Updater::new(store.clone(), config.updater));
        Self {
            store,
            strategy,
            reconciler,
            registrar,
        }
    }

    pub async fn register(&self, name: &str, priority: i32, raw: &str) {
        self.registrar
            .register(&key(), &template(), owner(name), priority, raw)
            .await
            .unwrap();
    }
}

pub fn key() -> RecordKey {
    RecordKey::from("zone-a")
}

pub fn owner(name: &str) -> OwnerRef {
    OwnerRef::new("ZoneSettings", "default", name)
}

pub fn template() -> RecordTemplate {
    RecordTemplate::new(KIND).scope("zone", "z-1")
}
