//! Bounded pool of expensive, stateful resources.

use super::{Expirable, ResourceFactory, StackStore};
use crate::error::{ConfigurationError, QueueError};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

struct PoolInner<R: Expirable> {
    name: String,
    size: usize,
    factory: Box<dyn ResourceFactory<R>>,
    /// One permit per resource that may exist, in flight or at rest.
    permits: Arc<Semaphore>,
    store: StackStore<R>,
    disposed: AtomicBool,
}

impl<R: Expirable> PoolInner<R> {
    /// Store a healthy resource. Once the pool is disposed it is handed back.
    fn release(&self, resource: R) -> Result<(), R> {
        self.store
            .push_unless(resource, || self.disposed.load(Ordering::SeqCst))?;
        debug!(pool = %self.name, "Returning item back to the pool");
        Ok(())
    }
}

/// Bounded pool gating access to at most `size` resources.
///
/// `acquire` waits for capacity, reuses the most recently returned idle
/// resource when one exists and otherwise asks the factory for a new one.
/// Capacity is handed back when the returned [`PoolLease`] is dropped, so every
/// acquire is matched by exactly one release.
///
/// Dispose only after all borrowers have returned their resource; leases that
/// outlive the pool disconnect their resource instead of storing it.
pub struct Pool<R: Expirable> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Expirable> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Expirable> std::fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .field("available", &self.inner.permits.available_permits())
            .field("idle", &self.inner.store.count())
            .finish()
    }
}

impl<R: Expirable> Pool<R> {
    /// Create a pool with a fixed capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Invalid`] when `size` is zero.
    pub fn new(
        name: impl Into<String>,
        size: usize,
        factory: impl ResourceFactory<R> + 'static,
        store: StackStore<R>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if size == 0 {
            return Err(ConfigurationError::Invalid {
                message: format!("pool '{}' size must be greater than zero", name),
            });
        }

        info!(pool = %name, size, "Created resource pool");

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                size,
                factory: Box::new(factory),
                permits: Arc::new(Semaphore::new(size)),
                store,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Borrow a resource, waiting while the pool is at capacity.
    ///
    /// # Errors
    ///
    /// - [`QueueError::PoolClosed`] when the pool has been disposed
    /// - whatever the factory returned when a new resource could not be built;
    ///   the capacity reserved for it is handed back first
    pub async fn acquire(&self) -> Result<PoolLease<R>, QueueError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| QueueError::PoolClosed {
                pool: self.inner.name.clone(),
            })?;

        if let Some(resource) = self.inner.store.pop() {
            debug!(pool = %self.inner.name, "Reusing idle item from the pool");
            return Ok(PoolLease::new(self.clone(), resource, permit));
        }

        match self.inner.factory.create().await {
            Ok(resource) => {
                debug!(pool = %self.inner.name, "Factory produced a new item");
                Ok(PoolLease::new(self.clone(), resource, permit))
            }
            Err(error) => {
                warn!(
                    pool = %self.inner.name,
                    error = %error,
                    "Factory method failed to produce a required instance"
                );
                drop(permit);
                Err(error)
            }
        }
    }

    /// Disconnect every idle resource and refuse further acquisitions.
    ///
    /// Calling this more than once has no further effect.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let idle = self.inner.store.drain();
        info!(
            pool = %self.inner.name,
            idle = idle.len(),
            "Disposing pool and disconnecting idle items"
        );
        for resource in idle {
            resource.expire();
        }
        self.inner.permits.close();
    }

    /// Expire idle resources past their time to live
    pub fn sweep(&self) -> usize {
        self.inner.store.sweep()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Capacity not currently held by a borrower
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Resources at rest in the store
    pub fn idle_count(&self) -> usize {
        self.inner.store.count()
    }
}

/// A resource on loan from a [`Pool`].
///
/// Dropping the lease releases it: a healthy resource goes back to the store,
/// a faulted one is disconnected and only its capacity is returned.
pub struct PoolLease<R: Expirable> {
    pool: Pool<R>,
    resource: Option<R>,
    permit: Option<OwnedSemaphorePermit>,
    faulted: AtomicBool,
}

impl<R: Expirable> PoolLease<R> {
    fn new(pool: Pool<R>, resource: R, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            resource: Some(resource),
            permit: Some(permit),
            faulted: AtomicBool::new(false),
        }
    }

    /// Flag the resource as unusable so it is never handed out again
    pub fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::SeqCst);
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Pool this lease returns to
    pub fn pool(&self) -> &Pool<R> {
        &self.pool
    }
}

impl<R: Expirable> Deref for PoolLease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        match &self.resource {
            Some(resource) => resource,
            // Only `drop` takes the resource.
            None => unreachable!("pool lease accessed after release"),
        }
    }
}

impl<R: Expirable> Drop for PoolLease<R> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };

        if self.is_faulted() {
            warn!(
                pool = %self.pool.name(),
                "Discarding faulted item; a replacement will be created on demand"
            );
            resource.expire();
        } else if let Err(resource) = self.pool.inner.release(resource) {
            debug!(pool = %self.pool.name(), "Pool disposed; disconnecting returned item");
            resource.expire();
        }

        // Capacity goes back only after the resource is at rest.
        drop(self.permit.take());
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
