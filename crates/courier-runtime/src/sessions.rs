//! Pooled sessions and the transactional wrappers built on top of them.
//!
//! Every handle given to callers wraps a [`PooledSession`], which holds a
//! [`PoolLease`] on a connected session. Dropping the lease is the single
//! point where the session goes back to its pool, flagged faulted when any
//! operation on it failed.
//!
//! # Wrappers
//!
//! - [`CommitPerCallProducer`]: commits after every successful send and rolls
//!   back when a send fails.
//! - [`CommitPerCallConsumer`]: commits after every receive.
//! - [`CommitPerScopeProducer`]: enlists in a [`Transaction`] and defers commit
//!   or rollback to the transaction's outcome. The session is released only
//!   when the transaction completes; dropping a handle to the wrapper does not
//!   release it.
//! - [`TransactedConsumer`]: the receiving counterpart of the per-scope
//!   producer. Messages received through it go back to the queue unless the
//!   transaction commits.

use crate::client::{
    MessageConsumer, MessageProducer, QueueConnector, QueueSession, SessionMode,
};
use crate::error::{QueueError, TransactionError};
use crate::message::{Destination, MessageId, QueueMessage};
use crate::pooling::{Expirable, PoolLease, ResourceFactory};
use crate::transaction::{
    EnlistmentNotification, Transaction, TransactionId, TransactionOutcome, Vote,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;

// ============================================================================
// Pooled resource
// ============================================================================

/// A connected session as stored in a pool
pub struct SessionResource {
    session: Box<dyn QueueSession>,
}

impl SessionResource {
    pub fn new(session: Box<dyn QueueSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &dyn QueueSession {
        self.session.as_ref()
    }
}

impl Expirable for SessionResource {
    fn expire(&self) {
        debug!(destination = %self.session.destination(), "Disconnecting pooled session");
        self.session.disconnect();
    }
}

/// Opens sessions to one destination when its pool runs dry
pub struct SessionFactory {
    connector: Arc<dyn QueueConnector>,
    destination: Destination,
    mode: SessionMode,
}

impl SessionFactory {
    pub fn new(connector: Arc<dyn QueueConnector>, destination: Destination, mode: SessionMode) -> Self {
        Self {
            connector,
            destination,
            mode,
        }
    }
}

#[async_trait]
impl ResourceFactory<SessionResource> for SessionFactory {
    async fn create(&self) -> Result<SessionResource, QueueError> {
        debug!(
            destination = %self.destination,
            transacted = self.mode.transacted,
            "Opening new session for pool"
        );
        let session = self.connector.connect(&self.destination, self.mode).await?;
        Ok(SessionResource::new(session))
    }
}

// ============================================================================
// Pooled session
// ============================================================================

/// A session on loan from a pool.
///
/// Any failed operation flags the session faulted so the pool disconnects it
/// instead of handing it to the next caller.
pub struct PooledSession {
    lease: PoolLease<SessionResource>,
}

impl PooledSession {
    pub fn new(lease: PoolLease<SessionResource>) -> Self {
        Self { lease }
    }

    fn session(&self) -> &dyn QueueSession {
        self.lease.session()
    }

    fn track<T>(&self, operation: &str, result: Result<T, QueueError>) -> Result<T, QueueError> {
        if let Err(error) = &result {
            warn!(
                destination = %self.destination(),
                operation,
                error = %error,
                "Session operation failed; session will not be reused"
            );
            self.lease.mark_faulted();
        }
        result
    }

    pub fn destination(&self) -> &Destination {
        self.session().destination()
    }

    pub fn is_transacted(&self) -> bool {
        self.session().is_transacted()
    }

    pub fn is_faulted(&self) -> bool {
        self.lease.is_faulted()
    }

    pub async fn commit(&self) -> Result<(), QueueError> {
        let result = self.session().commit().await;
        self.track("commit", result)
    }

    pub async fn rollback(&self) -> Result<(), QueueError> {
        let result = self.session().rollback().await;
        self.track("rollback", result)
    }
}

#[async_trait]
impl MessageProducer for PooledSession {
    fn create_message(&self) -> QueueMessage {
        self.session().create_message()
    }

    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        let result = self.session().send(message).await;
        self.track("send", result)
    }
}

#[async_trait]
impl MessageConsumer for PooledSession {
    async fn receive(&self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let result = self.session().receive(timeout).await;
        self.track("receive", result)
    }

    async fn receive_no_wait(&self) -> Result<Option<QueueMessage>, QueueError> {
        let result = self.session().receive_no_wait().await;
        self.track("receive_no_wait", result)
    }
}

// ============================================================================
// Per-call wrappers
// ============================================================================

/// Producer committing each send on its own
pub struct CommitPerCallProducer {
    session: PooledSession,
}

impl CommitPerCallProducer {
    pub fn new(session: PooledSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl MessageProducer for CommitPerCallProducer {
    fn create_message(&self) -> QueueMessage {
        self.session.create_message()
    }

    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        match self.session.send(message).await {
            Ok(id) => {
                self.session.commit().await?;
                Ok(id)
            }
            Err(error) => {
                if let Err(rollback_error) = self.session.rollback().await {
                    warn!(
                        destination = %self.session.destination(),
                        error = %rollback_error,
                        "Rollback after failed send also failed"
                    );
                }
                Err(error)
            }
        }
    }
}

/// Consumer acknowledging each received message on its own
pub struct CommitPerCallConsumer {
    session: PooledSession,
}

impl CommitPerCallConsumer {
    pub fn new(session: PooledSession) -> Self {
        Self { session }
    }

    async fn acknowledge(
        &self,
        received: Result<Option<QueueMessage>, QueueError>,
    ) -> Result<Option<QueueMessage>, QueueError> {
        match received {
            Ok(Some(message)) => {
                self.session.commit().await?;
                Ok(Some(message))
            }
            other => other,
        }
    }
}

#[async_trait]
impl MessageConsumer for CommitPerCallConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let received = self.session.receive(timeout).await;
        self.acknowledge(received).await
    }

    async fn receive_no_wait(&self) -> Result<Option<QueueMessage>, QueueError> {
        let received = self.session.receive_no_wait().await;
        self.acknowledge(received).await
    }
}

// ============================================================================
// Per-scope wrappers
// ============================================================================

/// Identity of a transaction-scoped producer: one per transaction and destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub transaction: TransactionId,
    pub destination: Destination,
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.transaction, self.destination)
    }
}

/// Slot filled by the first send of a transaction to a destination
pub type ScopedProducerSlot = Arc<OnceCell<Arc<CommitPerScopeProducer>>>;

/// Live transaction-scoped producers
pub type ScopedProducers = DashMap<ScopeKey, ScopedProducerSlot>;

/// Session shared by every participant callback. `None` once released.
type EnlistedSession = tokio::sync::Mutex<Option<PooledSession>>;

async fn commit_enlisted(session: &EnlistedSession) -> Result<(), String> {
    match session.lock().await.as_ref() {
        Some(session) => session.commit().await.map_err(|e| e.to_string()),
        None => Ok(()),
    }
}

async fn rollback_enlisted(session: &EnlistedSession, key: &(dyn std::fmt::Display + Sync)) {
    if let Some(session) = session.lock().await.as_ref() {
        if let Err(error) = session.rollback().await {
            warn!(scope = %key, error = %error, "Failed to roll back enlisted session");
        }
    }
}

/// Producer whose sends take effect with the transaction it is enlisted in.
///
/// Sends through one instance are serialized on its session, so all sends
/// of a transaction to a destination keep their order.
pub struct CommitPerScopeProducer {
    key: ScopeKey,
    /// Blank message as created by the enlisted session
    template: QueueMessage,
    session: EnlistedSession,
    registry: Weak<ScopedProducers>,
}

impl CommitPerScopeProducer {
    /// Wrap `session` and enlist it in `transaction`.
    ///
    /// The wrapper removes itself from `registry` when the transaction
    /// completes; inserting it is the caller's job.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::NoAmbientTransaction`] when `transaction` is `None`
    /// - [`TransactionError::AlreadyCompleted`] when the transaction is finishing
    pub fn enlist(
        transaction: Option<&Transaction>,
        session: PooledSession,
        registry: &Arc<ScopedProducers>,
    ) -> Result<Arc<Self>, TransactionError> {
        let transaction = transaction.ok_or(TransactionError::NoAmbientTransaction)?;
        let key = ScopeKey {
            transaction: transaction.local_id(),
            destination: session.destination().clone(),
        };

        debug!(scope = %key, "Enlisting producer in transaction");
        let producer = Arc::new(Self {
            key,
            template: session.create_message(),
            session: tokio::sync::Mutex::new(Some(session)),
            registry: Arc::downgrade(registry),
        });
        transaction.enlist(Arc::clone(&producer) as Arc<dyn EnlistmentNotification>)?;
        Ok(producer)
    }

    pub fn key(&self) -> &ScopeKey {
        &self.key
    }
}

#[async_trait]
impl MessageProducer for CommitPerScopeProducer {
    fn create_message(&self) -> QueueMessage {
        self.template.clone()
    }

    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.send(message).await,
            None => Err(TransactionError::AlreadyCompleted {
                id: self.key.transaction,
            }
            .into()),
        }
    }
}

#[async_trait]
impl EnlistmentNotification for CommitPerScopeProducer {
    async fn prepare(&self) -> Vote {
        Vote::Prepared
    }

    async fn commit(&self) -> Result<(), String> {
        commit_enlisted(&self.session).await
    }

    async fn rollback(&self) {
        rollback_enlisted(&self.session, &self.key).await;
    }

    async fn in_doubt(&self) {
        rollback_enlisted(&self.session, &self.key).await;
    }

    async fn transaction_completed(&self, outcome: TransactionOutcome) {
        debug!(scope = %self.key, ?outcome, "Removing pending scoped producer");
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key);
        }
        drop(self.session.lock().await.take());
    }
}

/// Consumer whose receives are acknowledged only if the transaction commits
pub struct TransactedConsumer {
    transaction: TransactionId,
    destination: Destination,
    session: EnlistedSession,
}

impl TransactedConsumer {
    /// Wrap `session` and enlist it in `transaction`.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::NoAmbientTransaction`] when `transaction` is `None`
    /// - [`TransactionError::AlreadyCompleted`] when the transaction is finishing
    pub fn enlist(
        transaction: Option<&Transaction>,
        session: PooledSession,
    ) -> Result<Arc<Self>, TransactionError> {
        let transaction = transaction.ok_or(TransactionError::NoAmbientTransaction)?;
        debug!(
            transaction_id = %transaction.local_id(),
            destination = %session.destination(),
            "Enlisting consumer in transaction"
        );

        let consumer = Arc::new(Self {
            transaction: transaction.local_id(),
            destination: session.destination().clone(),
            session: tokio::sync::Mutex::new(Some(session)),
        });
        transaction.enlist(Arc::clone(&consumer) as Arc<dyn EnlistmentNotification>)?;
        Ok(consumer)
    }

    fn completed_error(&self) -> QueueError {
        TransactionError::AlreadyCompleted {
            id: self.transaction,
        }
        .into()
    }
}

impl std::fmt::Display for TransactedConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.transaction, self.destination)
    }
}

#[async_trait]
impl MessageConsumer for TransactedConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.receive(timeout).await,
            None => Err(self.completed_error()),
        }
    }

    async fn receive_no_wait(&self) -> Result<Option<QueueMessage>, QueueError> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.receive_no_wait().await,
            None => Err(self.completed_error()),
        }
    }
}

#[async_trait]
impl EnlistmentNotification for TransactedConsumer {
    async fn prepare(&self) -> Vote {
        Vote::Prepared
    }

    async fn commit(&self) -> Result<(), String> {
        commit_enlisted(&self.session).await
    }

    async fn rollback(&self) {
        rollback_enlisted(&self.session, self).await;
    }

    async fn in_doubt(&self) {
        rollback_enlisted(&self.session, self).await;
    }

    async fn transaction_completed(&self, _outcome: TransactionOutcome) {
        drop(self.session.lock().await.take());
    }

    fn commits_last(&self) -> bool {
        true
    }
}
