//! Resource pooling: a bounded pool backed by an expiring LIFO store.

use crate::error::QueueError;
use async_trait::async_trait;

mod pool;
mod store;

pub use pool::{Pool, PoolLease};
pub use store::{ExpirableItem, StackStore};

/// A pooled resource that can be force-expired (disconnected) independently of
/// being returned to its pool.
pub trait Expirable: Send + Sync + 'static {
    fn expire(&self);
}

/// Builds a new resource when the pool has no idle one to hand out.
#[async_trait]
pub trait ResourceFactory<R>: Send + Sync {
    async fn create(&self) -> Result<R, QueueError>;
}
