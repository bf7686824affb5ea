use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use concord_core::store::file::key_from_path;
use concord_core::{ChangeKind, FileStore, RecordKey, Store, StoreEvent};
use concord_sync::{Action, CredentialsResolver, Debouncer, Reconciler, StrategyTable, SyncError};

use crate::config::HostConfig;
use crate::error::{io_err, DaemonError};

type Queue = mpsc::UnboundedSender<RecordKey>;

/// Everything the host needs to drive reconciliation for one store.
pub struct Host {
    store: Arc<dyn Store>,
    strategies: Arc<StrategyTable>,
    credentials: Arc<dyn CredentialsResolver>,
    config: HostConfig,
    watch_dir: Option<PathBuf>,
}

impl Host {
    pub fn new(
        store: Arc<dyn Store>,
        strategies: StrategyTable,
        credentials: Arc<dyn CredentialsResolver>,
        config: HostConfig,
    ) -> Self {
        Self {
            store,
            strategies: Arc::new(strategies),
            credentials,
            config,
            watch_dir: None,
        }
    }

    /// Also trigger passes for record files edited outside this process.
    pub fn watch(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = Some(dir.into());
        self
    }
}

/// Load config from `home`, open the file store and block until shutdown.
pub fn start_blocking(
    home: &Path,
    strategies: StrategyTable,
    credentials: Arc<dyn CredentialsResolver>,
) -> Result<(), DaemonError> {
    let config = HostConfig::load_at(home)?;
    init_tracing(config.json_logs);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;

    let store_root = config.store_root(home);
    let store = FileStore::open(&store_root)?;
    let records_dir = store.records_dir();
    tracing::info!(
        store = %store_root.display(),
        strategies = strategies.len(),
        workers = config.workers(),
        "starting concord host",
    );

    let host = Host::new(Arc::new(store), strategies, credentials, config).watch(records_dir);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    runtime.block_on(run(host, shutdown_tx))
}

/// Run the host until `shutdown_tx` fires or a task fails.
///
/// Must be called from within a tokio runtime.
pub async fn run(host: Host, shutdown_tx: broadcast::Sender<()>) -> Result<(), DaemonError> {
    let Host {
        store,
        strategies,
        credentials,
        config,
        watch_dir,
    } = host;

    let (queue_tx, queue_rx) = mpsc::unbounded_channel::<RecordKey>();
    let intake = Debouncer::<RecordKey>::new();
    let debounce = config.engine.debounce();
    // Subscribe before the initial resync lists keys so no change slips between.
    let events = store.subscribe();

    let reconciler = Reconciler::new(store.clone(), strategies, credentials, &config.engine)
        .with_debouncer(intake.clone());
    let dispatcher = Dispatcher::new(
        reconciler,
        config.workers(),
        queue_tx.clone(),
        config.error_requeue(),
    );

    let intake_handle = {
        let shutdown = shutdown_tx.clone();
        let store = store.clone();
        let intake = intake.clone();
        let queue = queue_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = intake_task(store, events, intake, debounce, queue, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let intake = intake.clone();
        let queue = queue_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = watcher_task(watch_dir, intake, debounce, queue, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let dispatcher_handle = {
        let shutdown = shutdown_tx.clone();
        let dispatcher = dispatcher.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = dispatcher_task(dispatcher, queue_rx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let resync_handle = {
        let shutdown = shutdown_tx.clone();
        let store = store.clone();
        let queue = queue_tx.clone();
        let interval = config.resync_interval();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = resync_task(store, queue, interval, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Signal(err)),
                    }
                }
            }
        })
    };

    let (intake_result, watcher_result, dispatcher_result, resync_result, signal_result) =
        tokio::join!(
            intake_handle,
            watcher_handle,
            dispatcher_handle,
            resync_handle,
            signal_handle
        );

    intake.flush();
    dispatcher.requeue.flush();

    handle_join("intake", intake_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("dispatcher", dispatcher_result)?;
    handle_join("resync", resync_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("concord host stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Intake: store notifications and file edits, coalesced per key
// ---------------------------------------------------------------------------

fn coalesce(intake: &Debouncer<RecordKey>, key: RecordKey, delay: Duration, queue: &Queue) {
    let queue = queue.clone();
    let fired = key.clone();
    intake.schedule(key, delay, async move {
        let _ = queue.send(fired);
    });
}

async fn intake_task(
    store: Arc<dyn Store>,
    mut events: broadcast::Receiver<StoreEvent>,
    intake: Debouncer<RecordKey>,
    debounce: Duration,
    queue: Queue,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = events.recv() => match event {
                Ok(event) if triggers_pass(event.change) => {
                    coalesce(&intake, event.key, debounce, &queue);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "change notifications dropped, resyncing");
                    resync(store.as_ref(), &queue).await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

/// Status writes are the engine's own bookkeeping and never start a pass.
fn triggers_pass(change: ChangeKind) -> bool {
    !matches!(change, ChangeKind::Status)
}

async fn watcher_task(
    dir: Option<PathBuf>,
    intake: Debouncer<RecordKey>,
    debounce: Duration,
    queue: Queue,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(dir) = dir else {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    };
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    let dir = fs::canonicalize(&dir).unwrap_or(dir);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::debug!(dir = %dir.display(), "watching record files");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for key in event.paths.iter().filter_map(|path| record_key_for(path, &dir)) {
                    coalesce(&intake, key, debounce, &queue);
                }
            }
        }
    }
    Ok(())
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn record_key_for(path: &Path, dir: &Path) -> Option<RecordKey> {
    if path.parent() != Some(dir) {
        return None;
    }
    key_from_path(path)
}

// ---------------------------------------------------------------------------
// Resync
// ---------------------------------------------------------------------------

async fn resync(store: &dyn Store, queue: &Queue) -> usize {
    match store.list().await {
        Ok(keys) => {
            let count = keys.len();
            for key in keys {
                let _ = queue.send(key);
            }
            tracing::debug!(records = count, "resync queued");
            count
        }
        Err(err) => {
            tracing::warn!(error = %err, "resync failed to list records");
            0
        }
    }
}

async fn resync_task(
    store: Arc<dyn Store>,
    queue: Queue,
    interval: Option<Duration>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let queued = resync(store.as_ref(), &queue).await;
    tracing::info!(records = queued, "initial resync queued");

    let Some(period) = interval else {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                resync(store.as_ref(), &queue).await;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch: bounded workers, one pass per key at a time
// ---------------------------------------------------------------------------

/// Keys currently being reconciled; `true` means another trigger arrived
/// mid-pass and the key must run again once the pass ends.
type InFlight = HashMap<RecordKey, bool>;

#[derive(Clone)]
struct Dispatcher {
    reconciler: Arc<Reconciler>,
    in_flight: Arc<Mutex<InFlight>>,
    permits: Arc<Semaphore>,
    requeue: Debouncer<RecordKey>,
    queue: Queue,
    error_requeue: Duration,
}

fn lock(in_flight: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    fn new(reconciler: Reconciler, workers: usize, queue: Queue, error_requeue: Duration) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(workers)),
            requeue: Debouncer::new(),
            queue,
            error_requeue,
        }
    }

    /// Start a worker for `key`, or mark the running one dirty.
    fn dispatch(&self, key: RecordKey, workers: &mut JoinSet<()>) {
        {
            let mut in_flight = lock(&self.in_flight);
            if let Some(dirty) = in_flight.get_mut(&key) {
                *dirty = true;
                return;
            }
            in_flight.insert(key.clone(), false);
        }
        let this = self.clone();
        workers.spawn(async move { this.work(key).await });
    }

    async fn work(self, key: RecordKey) {
        loop {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                lock(&self.in_flight).remove(&key);
                return;
            };
            let result = self.reconciler.reconcile(&key).await;
            drop(permit);
            self.settle(&key, result);

            // Check and release under one lock so a late trigger is never lost.
            let mut in_flight = lock(&self.in_flight);
            if in_flight.get(&key).copied().unwrap_or(false) {
                in_flight.insert(key.clone(), false);
            } else {
                in_flight.remove(&key);
                return;
            }
        }
    }

    fn settle(&self, key: &RecordKey, result: Result<Action, SyncError>) {
        match result {
            Ok(Action::Done) => {}
            Ok(Action::AwaitChange) => {
                tracing::debug!(key = %key, "parked until the next spec change");
            }
            Ok(Action::Requeue(delay)) => self.requeue_after(key, delay),
            Err(err) => {
                tracing::error!(key = %key, error = %err, "reconcile pass failed");
                self.requeue_after(key, self.error_requeue);
            }
        }
    }

    fn requeue_after(&self, key: &RecordKey, delay: Duration) {
        let queue = self.queue.clone();
        let fired = key.clone();
        self.requeue.schedule(key.clone(), delay, async move {
            let _ = queue.send(fired);
        });
    }

    fn is_running(&self, key: &RecordKey) -> bool {
        lock(&self.in_flight).contains_key(key)
    }
}

async fn dispatcher_task(
    dispatcher: Dispatcher,
    mut queue_rx: mpsc::UnboundedReceiver<RecordKey>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(key) = queue_rx.recv() => dispatcher.dispatch(key, &mut workers),
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "reconcile worker aborted");
                }
            }
        }
    }

    // Let passes already running finish their writes.
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "reconcile worker aborted");
        }
    }
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Join {
            task,
            message: err.to_string(),
        }),
    }
}

/// Install the global subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}
