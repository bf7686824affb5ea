//! YAML-file-backed store.
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//!   records/               (mode 0700)
//!     <record_key>.yaml    (one file per record, mode 0600)
//! ```
//!
//! Write flow: serialize → `<key>.yaml.tmp` sibling → `chmod 0600` → `rename`.
//! The `.tmp` always sits next to the target, so the rename stays on one
//! filesystem and a crash mid-write leaves the previous version intact.
//!
//! Conditional writes are serialised by a store-local lock. The token check
//! protects against stale in-memory copies; it does not coordinate several
//! processes sharing one directory.
//!
//! Tokens come from one store-wide sequence floored at the wall clock in
//! microseconds, so a record recreated under a deleted key (even after a
//! restart) never reissues a token a stale copy could still hold.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use super::{check_token, notify, ChangeKind, Store, StoreEvent, EVENT_CHANNEL_CAPACITY};
use crate::error::{io_err, StoreError};
use crate::types::{ConcurrencyToken, ManagedRecord, RecordKey};

pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    last_token: Arc<AtomicU64>,
    events: broadcast::Sender<StoreEvent>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let dir = records_dir_at(&root);
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            set_dir_permissions(&dir)?;
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            last_token: Arc::new(AtomicU64::new(0)),
            events,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_dir(&self) -> PathBuf {
        records_dir_at(&self.root)
    }

    fn path_for(&self, key: &RecordKey) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(record_path_at(&self.root, key))
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `<root>/records/`
pub fn records_dir_at(root: &Path) -> PathBuf {
    root.join("records")
}

/// `<root>/records/<key>.yaml`. Pure, no I/O.
pub fn record_path_at(root: &Path, key: &RecordKey) -> PathBuf {
    records_dir_at(root).join(format!("{}.yaml", key.0))
}

/// Map a file under the records directory back to its key.
///
/// Returns `None` for anything that is not a committed record file.
pub fn key_from_path(path: &Path) -> Option<RecordKey> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".yaml")?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(RecordKey::from(stem))
}

fn validate_key(key: &RecordKey) -> Result<(), StoreError> {
    let reason = if key.0.is_empty() {
        "empty"
    } else if key.0.contains(['/', '\\']) {
        "contains a path separator"
    } else if key.0.starts_with('.') {
        "starts with '.'"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidKey {
        key: key.clone(),
        reason,
    })
}

// ---------------------------------------------------------------------------
// Blocking load / save
// ---------------------------------------------------------------------------

fn load_record(path: &Path, key: &RecordKey) -> Result<ManagedRecord, StoreError> {
    if !path.exists() {
        return Err(StoreError::NotFound { key: key.clone() });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn save_record(path: &Path, record: &ManagedRecord) -> Result<(), StoreError> {
    let yaml = serde_yaml::to_string(record)?;
    let tmp = path.with_file_name(format!("{}.yaml.tmp", record.key.0));
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

/// Next token: above every token issued so far, above `floor`, and no
/// lower than the clock.
fn issue_token(last: &AtomicU64, floor: ConcurrencyToken) -> ConcurrencyToken {
    let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
    let next = |prev: u64| prev.max(now).max(floor.0) + 1;
    let prev = last
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(next(prev)))
        .unwrap_or_else(|prev| prev);
    ConcurrencyToken(next(prev))
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| StoreError::Backend(format!("blocking store task failed: {err}")))?
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for FileStore {
    async fn get(&self, key: &RecordKey) -> Result<ManagedRecord, StoreError> {
        let path = self.path_for(key)?;
        let key = key.clone();
        blocking(move || load_record(&path, &key)).await
    }

    async fn create(&self, mut record: ManagedRecord) -> Result<ManagedRecord, StoreError> {
        let path = self.path_for(&record.key)?;
        let _guard = self.write_lock.lock().await;

        record.token = issue_token(&self.last_token, ConcurrencyToken::default());
        let created = blocking(move || {
            if path.exists() {
                return Err(StoreError::AlreadyExists { key: record.key });
            }
            save_record(&path, &record)?;
            Ok(record)
        })
        .await?;

        tracing::debug!(key = %created.key, "created record file");
        notify(&self.events, &created.key, ChangeKind::Created);
        Ok(created)
    }

    async fn update(&self, record: &ManagedRecord) -> Result<ConcurrencyToken, StoreError> {
        let path = self.path_for(&record.key)?;
        let _guard = self.write_lock.lock().await;

        let incoming = record.clone();
        let last = Arc::clone(&self.last_token);
        let token = blocking(move || {
            let stored = load_record(&path, &incoming.key)?;
            check_token(&incoming, &stored)?;
            let mut next = incoming;
            next.status = stored.status;
            next.token = issue_token(&last, stored.token);
            next.updated_at = Utc::now();
            save_record(&path, &next)?;
            Ok(next.token)
        })
        .await?;

        notify(&self.events, &record.key, ChangeKind::Spec);
        Ok(token)
    }

    async fn update_status(&self, record: &ManagedRecord) -> Result<ConcurrencyToken, StoreError> {
        let path = self.path_for(&record.key)?;
        let _guard = self.write_lock.lock().await;

        let incoming = record.clone();
        let last = Arc::clone(&self.last_token);
        let token = blocking(move || {
            let mut stored = load_record(&path, &incoming.key)?;
            check_token(&incoming, &stored)?;
            stored.status = incoming.status;
            stored.token = issue_token(&last, stored.token);
            save_record(&path, &stored)?;
            Ok(stored.token)
        })
        .await?;

        notify(&self.events, &record.key, ChangeKind::Status);
        Ok(token)
    }

    async fn delete(&self, record: &ManagedRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.key)?;
        let _guard = self.write_lock.lock().await;

        let incoming = record.clone();
        blocking(move || {
            let stored = load_record(&path, &incoming.key)?;
            check_token(&incoming, &stored)?;
            if stored.pending_teardown {
                return Err(StoreError::TeardownPending { key: incoming.key });
            }
            std::fs::remove_file(&path).map_err(|e| io_err(&path, e))
        })
        .await?;

        tracing::debug!(key = %record.key, "deleted record file");
        notify(&self.events, &record.key, ChangeKind::Deleted);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RecordKey>, StoreError> {
        let dir = self.records_dir();
        blocking(move || {
            if !dir.exists() {
                return Ok(vec![]);
            }
            let mut keys: Vec<RecordKey> = std::fs::read_dir(&dir)
                .map_err(|e| io_err(&dir, e))?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|e| key_from_path(&e.path()))
                .collect();
            keys.sort();
            Ok(keys)
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
