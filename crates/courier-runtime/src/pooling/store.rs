//! Expiring LIFO store backing a pool's idle resources.

use super::Expirable;
use crate::clock::Clock;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A stored resource paired with the instant after which it is stale
#[derive(Debug)]
pub struct ExpirableItem<R> {
    item: R,
    expiration: DateTime<Utc>,
}

impl<R: Expirable> ExpirableItem<R> {
    fn new(item: R, expiration: DateTime<Utc>) -> Self {
        Self { item, expiration }
    }

    /// Instant after which a sweep evicts the item
    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration < now
    }

    fn expire(&self) {
        self.item.expire();
    }

    fn into_item(self) -> R {
        self.item
    }
}

struct StoreInner<R> {
    time_to_live: chrono::Duration,
    /// Shared by push/pop/count, exclusive for sweep.
    gate: RwLock<()>,
    /// Bottom of the stack is index 0.
    stack: Mutex<Vec<ExpirableItem<R>>>,
}

impl<R: Expirable> StoreInner<R> {
    fn sweep(&self) -> usize {
        let _exclusive = self.gate.write();

        let now = Clock::now();
        let items = std::mem::take(&mut *self.stack.lock());
        let (expired, alive): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|item| item.is_expired_at(now));

        *self.stack.lock() = alive;

        for item in &expired {
            debug!(
                expiration = %item.expiration(),
                "Identified idle item past its time to live; expiring it"
            );
            item.expire();
        }

        expired.len()
    }
}

/// LIFO stack of idle resources with time-to-live eviction.
///
/// `pop` hands back the most recently returned resource so that warm
/// connections are reused first. A periodic sweep (or an explicit call to
/// [`StackStore::sweep`]) expires every item older than the time to live while
/// keeping the relative order of the survivors.
pub struct StackStore<R: Expirable> {
    inner: Arc<StoreInner<R>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<R: Expirable> StackStore<R> {
    /// Create a store and, when `start` is set, a background sweeper that runs
    /// every `cleanup_interval` on the current tokio runtime.
    pub fn new(time_to_live: Duration, cleanup_interval: Duration, start: bool) -> Self {
        let inner = Arc::new(StoreInner {
            time_to_live: chrono::Duration::from_std(time_to_live)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
            gate: RwLock::new(()),
            stack: Mutex::new(Vec::new()),
        });

        let sweeper = if start {
            Self::spawn_sweeper(Arc::downgrade(&inner), cleanup_interval)
        } else {
            None
        };

        Self { inner, sweeper }
    }

    fn spawn_sweeper(
        inner: Weak<StoreInner<R>>,
        cleanup_interval: Duration,
    ) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime available; idle items will only be swept on demand");
            return None;
        };

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let removed = inner.sweep();
                if removed > 0 {
                    debug!(removed, "Periodic sweep expired idle items");
                }
            }
        }))
    }

    /// Put an item on top of the stack, stamped with `now + time_to_live`
    pub fn push(&self, item: R) {
        let _shared = self.inner.gate.read();
        self.push_locked(item);
    }

    /// Push `item` unless `refused` holds, checked under the same gate that
    /// [`StackStore::drain`] takes exclusively. A refused item is handed back.
    pub fn push_unless(&self, item: R, refused: impl FnOnce() -> bool) -> Result<(), R> {
        let _shared = self.inner.gate.read();
        if refused() {
            return Err(item);
        }
        self.push_locked(item);
        Ok(())
    }

    fn push_locked(&self, item: R) {
        let expiration = Clock::now() + self.inner.time_to_live;
        self.inner
            .stack
            .lock()
            .push(ExpirableItem::new(item, expiration));
    }

    /// Take the most recently pushed item
    pub fn pop(&self) -> Option<R> {
        let _shared = self.inner.gate.read();
        self.inner
            .stack
            .lock()
            .pop()
            .map(ExpirableItem::into_item)
    }

    /// Number of idle items
    pub fn count(&self) -> usize {
        let _shared = self.inner.gate.read();
        self.inner.stack.lock().len()
    }

    /// Expire and remove every stale item, returning how many were removed
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Remove every item regardless of age, most recent first
    pub fn drain(&self) -> Vec<R> {
        let _exclusive = self.inner.gate.write();
        let mut items = std::mem::take(&mut *self.inner.stack.lock());
        items.reverse();
        items.into_iter().map(ExpirableItem::into_item).collect()
    }
}

impl<R: Expirable> Drop for StackStore<R> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
