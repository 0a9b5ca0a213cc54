//! Producer and consumer providers: per-destination pools plus transaction affinity.

use crate::client::{MessageConsumer, MessageProducer, QueueConnector, SessionMode};
use crate::error::{ConfigurationError, QueueError};
use crate::message::Destination;
use crate::pooling::{Pool, StackStore};
use crate::sessions::{
    CommitPerCallConsumer, CommitPerCallProducer, CommitPerScopeProducer, PooledSession,
    ScopeKey, ScopedProducers, SessionFactory, SessionResource, TransactedConsumer,
};
use crate::transaction::Transaction;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub type SessionPool = Pool<SessionResource>;

/// Sizing and idle eviction of the pool created for each destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum sessions per destination, in use or idle
    pub size: usize,
    /// Idle time after which a session is disconnected
    pub time_to_live_seconds: u64,
    /// How often idle sessions are checked
    pub cleanup_interval_seconds: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 10,
            time_to_live_seconds: 60,
            cleanup_interval_seconds: 30,
        }
    }
}

impl PoolSettings {
    pub fn time_to_live(&self) -> Duration {
        Duration::from_secs(self.time_to_live_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "pool size must be greater than zero".to_string(),
            });
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "pool cleanup interval must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Pool registry
// ============================================================================

/// One pool per destination, created on first use
struct PoolRegistry {
    kind: &'static str,
    connector: Arc<dyn QueueConnector>,
    mode: SessionMode,
    settings: PoolSettings,
    pools: DashMap<Destination, SessionPool>,
    creation: Mutex<()>,
}

impl PoolRegistry {
    fn new(
        kind: &'static str,
        connector: Arc<dyn QueueConnector>,
        transactional: bool,
        settings: PoolSettings,
    ) -> Self {
        Self {
            kind,
            connector,
            mode: SessionMode {
                transacted: transactional,
            },
            settings,
            pools: DashMap::new(),
            creation: Mutex::new(()),
        }
    }

    fn pool_for(&self, destination: &Destination) -> Result<SessionPool, QueueError> {
        if let Some(pool) = self.pools.get(destination) {
            return Ok(pool.clone());
        }

        let _creating = self.creation.lock();
        if let Some(pool) = self.pools.get(destination) {
            return Ok(pool.clone());
        }

        info!(
            kind = self.kind,
            destination = %destination,
            size = self.settings.size,
            "Going to create new pool for destination"
        );
        let store = StackStore::new(
            self.settings.time_to_live(),
            self.settings.cleanup_interval(),
            true,
        );
        let factory = SessionFactory::new(
            Arc::clone(&self.connector),
            destination.clone(),
            self.mode,
        );
        let pool = Pool::new(
            format!("{}:{}", self.kind, destination),
            self.settings.size,
            factory,
            store,
        )?;

        self.pools.insert(destination.clone(), pool.clone());
        Ok(pool)
    }

    fn get(&self, destination: &Destination) -> Option<SessionPool> {
        self.pools.get(destination).map(|pool| pool.clone())
    }

    fn dispose(&self) {
        for pool in self.pools.iter() {
            pool.value().dispose();
        }
        self.pools.clear();
    }
}

// ============================================================================
// Producer provider
// ============================================================================

/// Hands out producers for destinations.
///
/// - transactional, with a transaction: the per-scope producer shared by every
///   send of that transaction to that destination
/// - transactional, without a transaction: a per-call producer
/// - not transactional: the pooled session itself
pub struct ProducerProvider {
    transactional: bool,
    registry: PoolRegistry,
    scoped: Arc<ScopedProducers>,
}

impl ProducerProvider {
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        transactional: bool,
        settings: PoolSettings,
    ) -> Self {
        Self {
            transactional,
            registry: PoolRegistry::new("producer", connector, transactional, settings),
            scoped: Arc::new(DashMap::new()),
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub async fn get_producer(
        &self,
        destination: &Destination,
        transaction: Option<&Transaction>,
    ) -> Result<Box<dyn MessageProducer>, QueueError> {
        let pool = self.registry.pool_for(destination)?;

        match transaction {
            Some(transaction) if self.transactional => {
                let producer = self.scoped_producer(&pool, destination, transaction).await?;
                Ok(Box::new(producer))
            }
            _ if self.transactional => {
                debug!(destination = %destination, "No transaction on transactional provider. Using per call producer.");
                let session = PooledSession::new(pool.acquire().await?);
                Ok(Box::new(CommitPerCallProducer::new(session)))
            }
            _ => Ok(Box::new(PooledSession::new(pool.acquire().await?))),
        }
    }

    async fn scoped_producer(
        &self,
        pool: &SessionPool,
        destination: &Destination,
        transaction: &Transaction,
    ) -> Result<Arc<CommitPerScopeProducer>, QueueError> {
        let key = ScopeKey {
            transaction: transaction.local_id(),
            destination: destination.clone(),
        };

        // Concurrent first sends wait on one slot instead of each taking a session.
        let slot = Arc::clone(&*self.scoped.entry(key.clone()).or_default());
        if let Some(existing) = slot.get() {
            debug!(scope = %key, "Detected pending scoped producer. Reusing the existing instance.");
            return Ok(Arc::clone(existing));
        }

        let created = slot
            .get_or_try_init(|| async {
                debug!(scope = %key, "No pending scoped producer. Acquiring a new instance.");
                let session = PooledSession::new(pool.acquire().await?);
                CommitPerScopeProducer::enlist(Some(transaction), session, &self.scoped)
                    .map_err(QueueError::from)
            })
            .await;

        match created {
            Ok(producer) => Ok(Arc::clone(producer)),
            Err(error) => {
                self.scoped
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                Err(error)
            }
        }
    }

    /// Transaction-scoped producers whose transaction has not completed yet
    pub fn scoped_producer_count(&self) -> usize {
        self.scoped.len()
    }

    /// Pool serving `destination`, if one has been created
    pub fn pool(&self, destination: &Destination) -> Option<SessionPool> {
        self.registry.get(destination)
    }

    /// Dispose every pool. Call only after all borrowed producers are released.
    pub fn dispose(&self) {
        self.registry.dispose();
    }
}

// ============================================================================
// Consumer provider
// ============================================================================

/// Hands out consumers for destinations.
///
/// - transactional, with a transaction: a consumer enlisted in it, whose
///   receives are undone unless the transaction commits
/// - transactional, without a transaction: a consumer acknowledging each
///   receive on its own
/// - not transactional: the pooled session itself
pub struct ConsumerProvider {
    transactional: bool,
    registry: PoolRegistry,
}

impl ConsumerProvider {
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        transactional: bool,
        settings: PoolSettings,
    ) -> Self {
        Self {
            transactional,
            registry: PoolRegistry::new("consumer", connector, transactional, settings),
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub async fn get_consumer(
        &self,
        destination: &Destination,
        transaction: Option<&Transaction>,
    ) -> Result<Box<dyn MessageConsumer>, QueueError> {
        let pool = self.registry.pool_for(destination)?;
        let session = PooledSession::new(pool.acquire().await?);

        match transaction {
            Some(transaction) if self.transactional => {
                debug!(destination = %destination, "Detected transaction. Wrapping the consumer in transacted consumer.");
                Ok(Box::new(TransactedConsumer::enlist(Some(transaction), session)?))
            }
            _ if self.transactional => Ok(Box::new(CommitPerCallConsumer::new(session))),
            _ => Ok(Box::new(session)),
        }
    }

    /// Pool serving `destination`, if one has been created
    pub fn pool(&self, destination: &Destination) -> Option<SessionPool> {
        self.registry.get(destination)
    }

    /// Dispose every pool. Call only after all borrowed consumers are released.
    pub fn dispose(&self) {
        self.registry.dispose();
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
