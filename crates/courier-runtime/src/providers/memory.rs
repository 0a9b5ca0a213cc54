//! In-memory queue broker for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Keeps one FIFO queue per destination
//! - Buffers the sends and receives of transacted sessions until commit, and
//!   puts received messages back at the head of the queue on rollback
//! - Acknowledges immediately on non-transacted sessions
//! - Assigns message ids and timestamps on delivery
//! - Wakes waiting receivers when messages arrive
//!
//! Faults can be injected for connect, send and receive, and the broker counts
//! the sessions it opened and closed so tests can check for leaks.

use crate::client::{QueueConnector, QueueSession, SessionMode};
use crate::clock::Clock;
use crate::error::QueueError;
use crate::message::{Destination, MessageId, QueueMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct BrokerQueue {
    messages: VecDeque<QueueMessage>,
    arrivals: Arc<Notify>,
}

#[derive(Default)]
struct FaultInjection {
    connects: AtomicU32,
    sends: AtomicU32,
    receives: AtomicU32,
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
struct BrokerInner {
    queues: Mutex<HashMap<Destination, BrokerQueue>>,
    faults: FaultInjection,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl BrokerInner {
    fn arrivals(&self, destination: &Destination) -> Arc<Notify> {
        let mut queues = self.queues.lock();
        Arc::clone(&queues.entry(destination.clone()).or_default().arrivals)
    }

    fn deliver(&self, destination: &Destination, messages: impl IntoIterator<Item = QueueMessage>) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(destination.clone()).or_default();
        queue.messages.extend(messages);
        queue.arrivals.notify_waiters();
    }

    /// Put messages back in front of the queue, keeping their order
    fn restore(&self, destination: &Destination, messages: Vec<QueueMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(destination.clone()).or_default();
        for message in messages.into_iter().rev() {
            queue.messages.push_front(message);
        }
        queue.arrivals.notify_waiters();
    }

    fn take(&self, destination: &Destination) -> Option<QueueMessage> {
        self.queues
            .lock()
            .get_mut(destination)
            .and_then(|queue| queue.messages.pop_front())
    }

    fn depth(&self, destination: &Destination) -> usize {
        self.queues
            .lock()
            .get(destination)
            .map_or(0, |queue| queue.messages.len())
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker implementing [`QueueConnector`]. Clones share state.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use courier_runtime::{
///     Destination, InMemoryBroker, QueueConnector, QueueMessage, QueueSession, SessionMode,
/// };
///
/// tokio_test::block_on(async {
///     let broker = InMemoryBroker::new();
///     let orders: Destination = "ORDERS@QM1/LOCALHOST/1414".parse().unwrap();
///
///     let session = broker.connect(&orders, SessionMode::TRANSACTED).await.unwrap();
///     session.send(QueueMessage::new(Bytes::from_static(b"hello"))).await.unwrap();
///     assert_eq!(broker.depth(&orders), 0);
///
///     session.commit().await.unwrap();
///     assert_eq!(broker.depth(&orders), 1);
/// });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed messages waiting on a destination
    pub fn depth(&self, destination: &Destination) -> usize {
        self.inner.depth(destination)
    }

    /// Snapshot of the committed messages on a destination, head first
    pub fn messages(&self, destination: &Destination) -> Vec<QueueMessage> {
        self.inner
            .queues
            .lock()
            .get(destination)
            .map(|queue| queue.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.faults.connects.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.faults.sends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` receives fail
    pub fn fail_next_receives(&self, count: u32) {
        self.inner.faults.receives.store(count, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet disconnected
    pub fn open_connections(&self) -> usize {
        self.connections_opened()
            .saturating_sub(self.connections_closed())
    }
}

#[async_trait]
impl QueueConnector for InMemoryBroker {
    async fn connect(
        &self,
        destination: &Destination,
        mode: SessionMode,
    ) -> Result<Box<dyn QueueSession>, QueueError> {
        if take_fault(&self.inner.faults.connects) {
            return Err(QueueError::ConnectionFailed {
                destination: destination.to_string(),
                message: "injected connection failure".to_string(),
            });
        }

        let number = self.inner.opened.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            destination = %destination,
            transacted = mode.transacted,
            session = number,
            "Opened in-memory session"
        );

        Ok(Box::new(InMemorySession {
            broker: Arc::clone(&self.inner),
            destination: destination.clone(),
            transacted: mode.transacted,
            connected: AtomicBool::new(true),
            pending: Mutex::new(PendingWork::default()),
        }))
    }

    async fn queue_depth(&self, destination: &Destination) -> Result<usize, QueueError> {
        Ok(self.inner.depth(destination))
    }
}

// ============================================================================
// InMemorySession
// ============================================================================

#[derive(Default)]
struct PendingWork {
    sends: Vec<QueueMessage>,
    receives: Vec<QueueMessage>,
}

/// Session against the in-memory broker
pub struct InMemorySession {
    broker: Arc<BrokerInner>,
    destination: Destination,
    transacted: bool,
    connected: AtomicBool,
    pending: Mutex<PendingWork>,
}

impl InMemorySession {
    fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Disconnected {
                destination: self.destination.to_string(),
            })
        }
    }

    fn try_take(&self) -> Option<QueueMessage> {
        let message = self.broker.take(&self.destination)?;
        if self.transacted {
            self.pending.lock().receives.push(message.clone());
        }
        Some(message)
    }

    fn check_receive_fault(&self) -> Result<(), QueueError> {
        if take_fault(&self.broker.faults.receives) {
            return Err(QueueError::ReceiveFailed {
                destination: self.destination.to_string(),
                message: "injected receive failure".to_string(),
            });
        }
        Ok(())
    }

    fn discard_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        self.broker.restore(&self.destination, pending.receives);
    }
}

#[async_trait]
impl QueueSession for InMemorySession {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn is_transacted(&self) -> bool {
        self.transacted
    }

    async fn send(&self, mut message: QueueMessage) -> Result<MessageId, QueueError> {
        self.ensure_connected()?;
        if take_fault(&self.broker.faults.sends) {
            return Err(QueueError::SendFailed {
                destination: self.destination.to_string(),
                message: "injected send failure".to_string(),
            });
        }

        let id = MessageId::new();
        message.id = Some(id.clone());
        message.timestamp = Some(Clock::now());

        if self.transacted {
            self.pending.lock().sends.push(message);
        } else {
            self.broker.deliver(&self.destination, [message]);
        }
        Ok(id)
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        self.ensure_connected()?;
        self.check_receive_fault()?;

        let deadline = tokio::time::Instant::now() + timeout;
        let arrivals = self.broker.arrivals(&self.destination);
        loop {
            let notified = arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_take() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_take());
            }
            self.ensure_connected()?;
        }
    }

    async fn receive_no_wait(&self) -> Result<Option<QueueMessage>, QueueError> {
        self.ensure_connected()?;
        self.check_receive_fault()?;
        Ok(self.try_take())
    }

    async fn commit(&self) -> Result<(), QueueError> {
        self.ensure_connected()?;
        if !self.transacted {
            return Err(QueueError::SessionFailed {
                operation: "commit".to_string(),
                message: "session is not transacted".to_string(),
            });
        }

        let pending = std::mem::take(&mut *self.pending.lock());
        self.broker.deliver(&self.destination, pending.sends);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), QueueError> {
        self.ensure_connected()?;
        if !self.transacted {
            return Err(QueueError::SessionFailed {
                operation: "rollback".to_string(),
                message: "session is not transacted".to_string(),
            });
        }

        self.discard_pending();
        Ok(())
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        // Uncommitted work is lost with the connection.
        self.discard_pending();
        self.broker.closed.fetch_add(1, Ordering::SeqCst);
        debug!(destination = %self.destination, "Closed in-memory session");
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
