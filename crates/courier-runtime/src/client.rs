//! Queue client capability consumed by the pooling and transaction layers.
//!
//! A [`QueueConnector`] opens [`QueueSession`]s against a destination. Every
//! vendor or wire specific detail lives behind these traits; the rest of the
//! crate only calls this surface.

use crate::error::QueueError;
use crate::message::{Destination, MessageId, QueueMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// How a session acknowledges the work done through it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionMode {
    /// Sends and receives take effect only on `commit`; `rollback` undoes them
    pub transacted: bool,
}

impl SessionMode {
    pub const TRANSACTED: Self = Self { transacted: true };
    pub const AUTO_ACKNOWLEDGE: Self = Self { transacted: false };
}

/// A connected session bound to one destination.
///
/// Sessions are stateful and are not meant to be used by two callers at once;
/// the pool hands each one to a single holder at a time.
#[async_trait]
pub trait QueueSession: Send + Sync {
    /// Destination the session is connected to
    fn destination(&self) -> &Destination;

    fn is_transacted(&self) -> bool;

    /// Create an empty message ready to be filled and sent
    fn create_message(&self) -> QueueMessage {
        QueueMessage::default()
    }

    /// Send a message and return the identifier the broker assigned to it
    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError>;

    /// Receive the next message, waiting at most `timeout`
    async fn receive(&self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Receive the next message if one is immediately available
    async fn receive_no_wait(&self) -> Result<Option<QueueMessage>, QueueError>;

    /// Make the work done since the last commit or rollback permanent
    async fn commit(&self) -> Result<(), QueueError>;

    /// Undo the work done since the last commit or rollback
    async fn rollback(&self) -> Result<(), QueueError>;

    /// Close the connection. Idempotent; later operations fail.
    fn disconnect(&self);
}

/// Factory for sessions against a queue manager
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(
        &self,
        destination: &Destination,
        mode: SessionMode,
    ) -> Result<Box<dyn QueueSession>, QueueError>;

    /// Number of messages currently waiting on the destination
    async fn queue_depth(&self, destination: &Destination) -> Result<usize, QueueError>;
}

/// Sending side handed out by a producer provider
#[async_trait]
pub trait MessageProducer: Send + Sync {
    fn create_message(&self) -> QueueMessage;

    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError>;
}

/// Receiving side handed out by a consumer provider
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn receive(&self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError>;

    async fn receive_no_wait(&self) -> Result<Option<QueueMessage>, QueueError>;
}

#[async_trait]
impl<P: MessageProducer + ?Sized> MessageProducer for Arc<P> {
    fn create_message(&self) -> QueueMessage {
        (**self).create_message()
    }

    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        (**self).send(message).await
    }
}

#[async_trait]
impl<C: MessageConsumer + ?Sized> MessageConsumer for Arc<C> {
    async fn receive(&self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        (**self).receive(timeout).await
    }

    async fn receive_no_wait(&self) -> Result<Option<QueueMessage>, QueueError> {
        (**self).receive_no_wait().await
    }
}

/// Drain every message currently on `destination`, returning how many were removed
pub async fn purge(
    connector: &dyn QueueConnector,
    destination: &Destination,
) -> Result<usize, QueueError> {
    let session = connector
        .connect(destination, SessionMode::AUTO_ACKNOWLEDGE)
        .await?;

    let mut purged = 0;
    let result = loop {
        match session.receive_no_wait().await {
            Ok(Some(_)) => purged += 1,
            Ok(None) => break Ok(purged),
            Err(e) => break Err(e),
        }
    };
    session.disconnect();

    match &result {
        Ok(count) => info!(destination = %destination, purged = count, "Purged destination"),
        Err(e) => debug!(destination = %destination, error = %e, "Purge interrupted"),
    }
    result
}
