//! End-to-end host behaviour over real stores.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

use concord_core::{
    ContributionSource, FileStore, ManagedRecord, MemoryStore, OwnerRef, Phase, RecordKey,
    ScopeIds, Store,
};
use concord_daemon::{run, Host, HostConfig};
use concord_sync::aggregate::SettingsAggregator;
use concord_sync::{
    Aggregation, CredentialHandle, DownstreamError, EngineConfig, NoCredentials, PushOutcome,
    RecordTemplate, Registrar, StrategyTable, SyncError, SyncStrategy, Updater, UpdaterConfig,
};

const KIND: &str = "zone-settings";

#[derive(Default)]
struct Recording {
    pushes: Mutex<Vec<Aggregation>>,
    teardowns: Mutex<Vec<Aggregation>>,
}

impl Recording {
    fn pushes(&self) -> Vec<Aggregation> {
        self.pushes.lock().unwrap().clone()
    }

    fn teardown_count(&self) -> usize {
        self.teardowns.lock().unwrap().len()
    }
}

#[async_trait]
impl SyncStrategy for Recording {
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
        Ok(PushOutcome {
            external_id: Some("ext-1".into()),
            ..PushOutcome::default()
        })
    }

    async fn teardown(
        &self,
        _scope: &ScopeIds,
        _credentials: &CredentialHandle,
        remaining: &Aggregation,
    ) -> Result<(), DownstreamError> {
        self.teardowns.lock().unwrap().push(remaining.clone());
        Ok(())
    }
}

fn key() -> RecordKey {
    RecordKey::from("zone-a")
}

fn owner() -> OwnerRef {
    OwnerRef::new("ZoneSettings", "default", "web")
}

fn quiet_config() -> HostConfig {
    HostConfig {
        resync_interval_secs: 0,
        ..HostConfig::default()
    }
}

fn host(store: Arc<dyn Store>, strategy: Arc<Recording>, config: HostConfig) -> Host {
    Host::new(
        store,
        StrategyTable::new().with(KIND, strategy),
        Arc::new(NoCredentials),
        config,
    )
}

#[tokio::test(start_paused = true)]
async fn burst_of_registrations_yields_one_push() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let strategy = Arc::new(Recording::default());
    let (shutdown_tx, _) = broadcast::channel(16);
    let handle = tokio::spawn(run(
        host(store.clone(), strategy.clone(), quiet_config()),
        shutdown_tx.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let registrar = Registrar::new(Updater::new(store.clone(), UpdaterConfig::default()));
    let template = RecordTemplate::new(KIND).scope("zone", "z-1");
    for level in 0..10 {
        registrar
            .register(&key(), &template, owner(), 100, format!(r#"{{"level":{level}}}"#))
            .await
            .expect("register");
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    let pushes = strategy.pushes();
    assert_eq!(pushes.len(), 1, "burst coalesces into a single push");
    assert_eq!(pushes[0].value, json!({"level": 9}));

    let record = store.get(&key()).await.expect("get");
    assert_eq!(record.status.phase, Phase::Synced);
    assert_eq!(record.external_id.0, "ext-1");

    shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn last_contributor_leaving_tears_down_and_deletes() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let strategy = Arc::new(Recording::default());
    let (shutdown_tx, _) = broadcast::channel(16);
    let handle = tokio::spawn(run(
        host(store.clone(), strategy.clone(), quiet_config()),
        shutdown_tx.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let registrar = Registrar::new(Updater::new(store.clone(), UpdaterConfig::default()));
    registrar
        .register(&key(), &RecordTemplate::new(KIND), owner(), 100, r#"{"ssl":"strict"}"#)
        .await
        .expect("register");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(strategy.pushes().len(), 1);

    assert!(registrar.unregister(&key(), &owner()).await.expect("unregister"));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(strategy.teardown_count(), 1);
    assert!(store.get(&key()).await.unwrap_err().is_not_found());

    shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("join").expect("clean shutdown");
}

async fn wait_for_phase(store: &dyn Store, key: &RecordKey, phase: Phase) -> ManagedRecord {
    for _ in 0..250 {
        if let Ok(record) = store.get(key).await {
            if record.status.phase == phase {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{key} never reached {phase:?}");
}

#[tokio::test]
async fn records_on_disk_are_picked_up_by_the_initial_resync() {
    let root = TempDir::new().expect("root");
    let file_store = FileStore::open(root.path()).expect("open");
    let records_dir = file_store.records_dir();
    let store: Arc<dyn Store> = Arc::new(file_store);

    let registrar = Registrar::new(Updater::new(store.clone(), UpdaterConfig::default()));
    registrar
        .register(&key(), &RecordTemplate::new(KIND), owner(), 100, r#"{"ssl":"strict"}"#)
        .await
        .expect("register");

    let strategy = Arc::new(Recording::default());
    let config = HostConfig {
        engine: EngineConfig {
            debounce_ms: 50,
            ..EngineConfig::default()
        },
        ..quiet_config()
    };
    let (shutdown_tx, _) = broadcast::channel(16);
    let handle = tokio::spawn(run(
        host(store.clone(), strategy.clone(), config).watch(records_dir),
        shutdown_tx.clone(),
    ));

    let record = wait_for_phase(store.as_ref(), &key(), Phase::Synced).await;
    assert_eq!(record.external_id.0, "ext-1");
    assert!(record.pending_teardown, "finalizer stays while the record lives");
    assert!(!strategy.pushes().is_empty());

    shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn failing_task_stops_the_whole_host() {
    let scratch = TempDir::new().expect("scratch");
    let blocker = scratch.path().join("not-a-dir");
    std::fs::write(&blocker, "file").expect("write blocker");

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let strategy = Arc::new(Recording::default());
    let (shutdown_tx, _) = broadcast::channel(16);

    let result = run(
        host(store, strategy, quiet_config()).watch(blocker.join("records")),
        shutdown_tx,
    )
    .await;

    let err = result.expect_err("watcher cannot create its directory");
    assert!(err.to_string().contains("not-a-dir"), "got {err}");
}
