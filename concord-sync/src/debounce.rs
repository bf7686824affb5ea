//! Per-key event coalescing.
//!
//! `schedule` replaces any timer already running for the key, so a burst of
//! triggers collapses into one action fired `delay` after the last of them.
//! Timers for different keys run independently. The timer map sits behind
//! one mutex that is only held for map bookkeeping, never across an await.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

struct Timers<K> {
    pending: HashMap<K, Timer>,
    next_id: u64,
}

pub struct Debouncer<K> {
    timers: Arc<Mutex<Timers<K>>>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self {
            timers: Arc::clone(&self.timers),
        }
    }
}

impl<K> Default for Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<K>(timers: &Mutex<Timers<K>>) -> MutexGuard<'_, Timers<K>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            timers: Arc::new(Mutex::new(Timers {
                pending: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Run `action` after `delay` unless `key` is rescheduled or cancelled
    /// first. Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: K, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = lock(&self.timers);
        timers.next_id += 1;
        let id = timers.next_id;
        if let Some(previous) = timers.pending.remove(&key) {
            previous.handle.abort();
        }

        let shared = Arc::clone(&self.timers);
        let fired_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = lock(&shared);
                match timers.pending.get(&fired_key) {
                    Some(timer) if timer.id == id => {
                        timers.pending.remove(&fired_key);
                    }
                    // Superseded between wake-up and lock.
                    _ => return,
                }
            }
            action.await;
        });
        timers.pending.insert(key, Timer { id, handle });
    }

    /// Stop `key`'s timer. Returns `true` if one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.timers).pending.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every timer and drop the pending actions.
    pub fn flush(&self) {
        let drained: Vec<Timer> = lock(&self.timers).pending.drain().map(|(_, t)| t).collect();
        for timer in drained {
            timer.handle.abort();
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.timers).pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.timers).pending.len()
    }
}
