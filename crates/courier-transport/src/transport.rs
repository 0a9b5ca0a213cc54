//! # Delivery Pipeline
//!
//! Workers receive messages from the input queue and hand them to the
//! application through a [`TransportObserver`].
//!
//! Each receive cycle runs as one unit of work. When the transport is
//! transactional the receive, every send made while handling the message, and
//! any dead-letter or forward all join a single transaction: a failed cycle
//! rolls back, which returns the message to the input queue for another try.
//!
//! Failures are counted per logical message in a [`RetryLedger`]. Once a
//! message has failed `max_retries` times it is moved to the error queue
//! instead of being processed again. A message whose body cannot be decoded is
//! moved there straight away, since retrying cannot fix it.
//!
//! Application code may call [`ProcessingContext::abort_handling_current_message`]
//! to roll the cycle back without counting a failure.

use crate::backoff::ReceiveBackoff;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::retry_ledger::RetryLedger;
use crate::serializer::MessageSerializer;
use async_trait::async_trait;
use bytes::Bytes;
use courier_runtime::codec::{
    error_queue_message, forwarded_message, from_queue_message, real_message_id,
    to_queue_message,
};
use courier_runtime::{
    purge, ConsumerProvider, Destination, MessageId, ProducerProvider, QueueConnector,
    QueueError, QueueMessage, SerializationError, Transaction, TransportMessage,
};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// Application seam
// ============================================================================

/// Receives the processing events raised by the workers.
///
/// An error returned from `message_received` or `finished_processing` rolls
/// the cycle back and counts as a failed attempt. An error from
/// `started_processing` rolls it back as well. Errors from
/// `failed_processing` are only logged.
#[async_trait]
pub trait TransportObserver: Send + Sync {
    async fn started_processing(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle one received message
    async fn message_received(
        &self,
        message: &TransportMessage,
        context: &ProcessingContext,
    ) -> anyhow::Result<()>;

    async fn finished_processing(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn failed_processing(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// State of the receive cycle handling the current message
pub struct ProcessingContext {
    core: Arc<TransportCore>,
    transaction: Option<Transaction>,
    aborted: AtomicBool,
}

impl ProcessingContext {
    fn new(core: Arc<TransportCore>, transaction: Option<Transaction>) -> Self {
        Self {
            core,
            transaction,
            aborted: AtomicBool::new(false),
        }
    }

    /// Transaction the cycle runs in, when the transport is transactional
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Roll the cycle back and keep the message, without counting a failure
    pub fn abort_handling_current_message(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Send a message as part of the current cycle
    pub async fn send(
        &self,
        message: &mut TransportMessage,
        destination: &str,
    ) -> Result<MessageId, TransportError> {
        self.core
            .send(message, destination, self.transaction.as_ref())
            .await
    }
}

/// What a single receive cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No message arrived within the receive timeout
    Idle,
    /// The receive itself failed; the worker backs off before the next one
    ReceiveFailed,
    Processed { message_id: Option<MessageId> },
    /// The message went to the error queue
    DeadLettered { message_id: Option<MessageId> },
    /// Processing was aborted on request and the message kept
    Aborted { message_id: Option<MessageId> },
    /// Processing failed and was rolled back where possible
    Failed { message_id: Option<MessageId> },
}

enum Interrupted {
    Abort(Option<MessageId>),
    Failure(Option<MessageId>),
}

// ============================================================================
// Shared pipeline state
// ============================================================================

/// Destinations resolved when the transport starts
#[derive(Debug)]
struct Addresses {
    input: Destination,
    error: Destination,
    forward: Option<Destination>,
}

impl Addresses {
    fn resolve(config: &TransportConfig) -> Result<Self, TransportError> {
        let forward = match &config.forward_received_messages_to {
            Some(name) => Some(config.destination(name)?),
            None => None,
        };
        Ok(Self {
            input: config.destination(&config.input_queue)?,
            error: config.destination(&config.error_queue)?,
            forward,
        })
    }
}

struct TransportCore {
    config: TransportConfig,
    connector: Arc<dyn QueueConnector>,
    serializer: Option<Arc<dyn MessageSerializer>>,
    observer: Arc<dyn TransportObserver>,
    producers: ProducerProvider,
    consumers: ConsumerProvider,
    ledger: RetryLedger,
    addresses: RwLock<Option<Arc<Addresses>>>,
}

impl TransportCore {
    fn addresses(&self) -> Option<Arc<Addresses>> {
        self.addresses.read().clone()
    }

    async fn send(
        &self,
        message: &mut TransportMessage,
        destination: &str,
        transaction: Option<&Transaction>,
    ) -> Result<MessageId, TransportError> {
        let destination = self.config.destination(destination)?;
        let wire = to_queue_message(message, self.encode_body(message)?);

        let producer = self.producers.get_producer(&destination, transaction).await?;
        let id = producer.send(wire).await?;

        debug!(destination = %destination, message_id = %id, "Sent message");
        message.id = Some(id.clone());
        Ok(id)
    }

    fn encode_body(&self, message: &TransportMessage) -> Result<Bytes, TransportError> {
        if let Some(raw) = &message.raw_body {
            return Ok(raw.clone());
        }
        match (&message.body, &self.serializer) {
            (None, _) => Ok(Bytes::new()),
            (Some(body), Some(serializer)) => Ok(serializer.serialize(body)?),
            (Some(_), None) => Err(TransportError::MissingSerializer),
        }
    }

    fn decode_body(&self, body: &[u8]) -> Result<serde_json::Value, SerializationError> {
        match &self.serializer {
            Some(serializer) => serializer.deserialize(body),
            None => Err(SerializationError::Decode {
                message: "no message serializer has been configured".to_string(),
            }),
        }
    }

    /// Run one receive cycle, inside a transaction when configured
    async fn run_cycle(self: &Arc<Self>, addresses: &Addresses) -> CycleOutcome {
        let transaction = self
            .config
            .is_transactional
            .then(|| Transaction::begin(self.config.transaction_options()));
        let context = ProcessingContext::new(Arc::clone(self), transaction.clone());

        let handled = self.receive_and_handle(addresses, &context).await;

        // Counted before the rollback hands the message to the next receiver.
        if let Err(Interrupted::Failure(message_id)) = &handled {
            self.record_failure(message_id.as_ref());
        }

        let handled = match transaction {
            Some(transaction) => self.complete(transaction, handled).await,
            None => handled,
        };

        match handled {
            Ok(outcome) => {
                if let CycleOutcome::Processed {
                    message_id: Some(id),
                }
                | CycleOutcome::DeadLettered {
                    message_id: Some(id),
                } = &outcome
                {
                    self.ledger.clear(id.as_str());
                }
                outcome
            }
            Err(Interrupted::Abort(message_id)) => {
                debug!(
                    message_id = ?message_id.as_ref().map(MessageId::as_str),
                    "Handling of message aborted; message kept"
                );
                CycleOutcome::Aborted { message_id }
            }
            Err(Interrupted::Failure(message_id)) => {
                if let Err(e) = guarded(self.observer.failed_processing()).await {
                    warn!(error = %e, "Failed raising 'failed message processing' event");
                }
                CycleOutcome::Failed { message_id }
            }
        }
    }

    /// Failures only count when a rollback can return the message for another try
    fn record_failure(&self, message_id: Option<&MessageId>) {
        if !self.config.is_transactional {
            return;
        }
        if let Some(id) = message_id {
            self.ledger.increment(id.as_str());
        }
    }

    /// Commit a cycle that handled its message, roll back anything else
    async fn complete(
        &self,
        transaction: Transaction,
        handled: Result<CycleOutcome, Interrupted>,
    ) -> Result<CycleOutcome, Interrupted> {
        let commit = matches!(
            handled,
            Ok(CycleOutcome::Processed { .. } | CycleOutcome::DeadLettered { .. })
        );

        if commit {
            if let Err(e) = transaction.commit().await {
                error!(transaction_id = %transaction.local_id(), error = %e, "Failed to commit receive cycle");
                let message_id = match handled {
                    Ok(
                        CycleOutcome::Processed { message_id }
                        | CycleOutcome::DeadLettered { message_id },
                    ) => message_id,
                    _ => None,
                };
                self.record_failure(message_id.as_ref());
                return Err(Interrupted::Failure(message_id));
            }
        } else if let Err(e) = transaction.rollback().await {
            warn!(transaction_id = %transaction.local_id(), error = %e, "Failed to roll back receive cycle");
        }
        handled
    }

    async fn receive(
        &self,
        input: &Destination,
        transaction: Option<&Transaction>,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let consumer = self.consumers.get_consumer(input, transaction).await?;
        consumer.receive(self.config.receive_timeout()).await
    }

    async fn receive_and_handle(
        &self,
        addresses: &Addresses,
        context: &ProcessingContext,
    ) -> Result<CycleOutcome, Interrupted> {
        let message = match self.receive(&addresses.input, context.transaction()).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(CycleOutcome::Idle),
            Err(e) => {
                error!(destination = %addresses.input, error = %e, "Problem in receiving message from queue");
                return Ok(CycleOutcome::ReceiveFailed);
            }
        };

        let message_id = real_message_id(&message);
        let id_field = message_id.as_ref().map(MessageId::as_str).unwrap_or_default();

        if self.config.is_transactional {
            if let Some(id) = &message_id {
                if self.ledger.has_reached_max(id.as_str()) {
                    error!(
                        message_id = %id,
                        max_retries = self.ledger.max_retries(),
                        "Message has failed the maximum number of times allowed"
                    );
                    return self
                        .dead_letter(&message, addresses, context, message_id.clone())
                        .await;
                }
            }
        }

        if let Err(e) = guarded(self.observer.started_processing()).await {
            warn!(message_id = id_field, error = %e, "Failed raising 'started message processing' event");
            return Err(Interrupted::Failure(message_id));
        }

        if let Some(forward) = &addresses.forward {
            if let Err(e) = self.forward(&message, forward, context.transaction()).await {
                error!(message_id = id_field, destination = %forward, error = %e, "Unexpected error while forwarding message");
                return Err(Interrupted::Failure(message_id));
            }
        }

        let mut received = from_queue_message(&message);
        if self.config.skip_deserialization {
            received.raw_body = Some(message.body.clone());
        } else if !message.body.is_empty() {
            match self.decode_body(&message.body) {
                Ok(body) => received.body = Some(body),
                Err(e) => {
                    error!(message_id = id_field, error = %e, "Could not extract message data");
                    return self
                        .dead_letter(&message, addresses, context, message_id.clone())
                        .await;
                }
            }
        }

        let received_ok = match guarded(self.observer.message_received(&received, context)).await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(message_id = id_field, error = %e, "Failed raising 'transport message received' event");
                false
            }
        };
        let finished_ok = self.notify_finished().await;

        // Abort wins over failure accounting so the message is never dead-lettered for it.
        if context.is_aborted() {
            return Err(Interrupted::Abort(message_id));
        }
        if !(received_ok && finished_ok) {
            return Err(Interrupted::Failure(message_id));
        }
        Ok(CycleOutcome::Processed { message_id })
    }

    /// Move `message` to the error queue and report the cycle finished
    async fn dead_letter(
        &self,
        message: &QueueMessage,
        addresses: &Addresses,
        context: &ProcessingContext,
        message_id: Option<MessageId>,
    ) -> Result<CycleOutcome, Interrupted> {
        let failed = error_queue_message(message, &addresses.input);
        let sent = match self
            .producers
            .get_producer(&addresses.error, context.transaction())
            .await
        {
            Ok(producer) => producer.send(failed).await,
            Err(e) => Err(e),
        };

        if let Err(e) = sent {
            error!(destination = %addresses.error, error = %e, "Failed to move message to error queue");
            return Err(Interrupted::Failure(message_id));
        }

        info!(
            message_id = ?message_id.as_ref().map(MessageId::as_str),
            destination = %addresses.error,
            "Moved message to error queue"
        );
        self.notify_finished().await;
        Ok(CycleOutcome::DeadLettered { message_id })
    }

    async fn forward(
        &self,
        message: &QueueMessage,
        destination: &Destination,
        transaction: Option<&Transaction>,
    ) -> Result<MessageId, QueueError> {
        let producer = self.producers.get_producer(destination, transaction).await?;
        producer.send(forwarded_message(message)).await
    }

    async fn notify_finished(&self) -> bool {
        match guarded(self.observer.finished_processing()).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed raising 'finished message processing' event");
                false
            }
        }
    }
}

/// Await an observer event, turning a panic into an error
async fn guarded<F>(event: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(event).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Workers
// ============================================================================

struct Worker {
    id: usize,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    stop.has_changed().is_err() || *stop.borrow()
}

/// Receive cycles until asked to stop. A cycle in flight always completes first.
async fn run_worker(
    core: Arc<TransportCore>,
    addresses: Arc<Addresses>,
    worker: usize,
    mut stop: watch::Receiver<bool>,
) {
    info!(worker, input = %addresses.input, "Worker started");
    let mut backoff = ReceiveBackoff::default();

    while !stop_requested(&stop) {
        let cycle = AssertUnwindSafe(core.run_cycle(&addresses))
            .catch_unwind()
            .await;

        match cycle {
            Ok(CycleOutcome::ReceiveFailed) => {
                tokio::select! {
                    _ = backoff.wait() => {}
                    _ = stop.changed() => {}
                }
            }
            Ok(_) => backoff.reset(),
            Err(panic) => {
                error!(worker, panic = %panic_message(panic.as_ref()), "Receive cycle panicked");
            }
        }
    }

    info!(worker, "Worker stopped");
}

// ============================================================================
// Transport
// ============================================================================

/// Transactional message transport over a remote queue.
///
/// # Examples
///
/// ```
/// use courier_runtime::{InMemoryBroker, TransportMessage};
/// use courier_transport::{
///     CycleOutcome, JsonMessageSerializer, ProcessingContext, Transport, TransportConfig,
///     TransportError, TransportObserver,
/// };
/// use serde_json::json;
/// use std::sync::Arc;
///
/// struct Orders;
///
/// #[async_trait::async_trait]
/// impl TransportObserver for Orders {
///     async fn message_received(
///         &self,
///         message: &TransportMessage,
///         _context: &ProcessingContext,
///     ) -> anyhow::Result<()> {
///         anyhow::ensure!(message.body == Some(json!({ "order": 42 })), "unexpected order");
///         Ok(())
///     }
/// }
///
/// tokio_test::block_on(async {
///     let mut config =
///         TransportConfig::new("ORDERS@QM1/LOCALHOST/1414", "ORDERS.ERRORS@QM1/LOCALHOST/1414");
///     config.number_of_worker_threads = 0;
///     let transport = Transport::new(
///         config,
///         Arc::new(InMemoryBroker::new()),
///         Some(Arc::new(JsonMessageSerializer)),
///         Arc::new(Orders),
///     );
///     transport.start().await?;
///
///     let mut message = TransportMessage::new().with_body(json!({ "order": 42 }));
///     transport.send(&mut message, "ORDERS@QM1/LOCALHOST/1414", None).await?;
///     let outcome = transport.receive_from_queue().await?;
///     assert!(matches!(outcome, CycleOutcome::Processed { .. }));
///
///     transport.stop().await;
///     Ok::<_, TransportError>(())
/// })
/// .unwrap();
/// ```
pub struct Transport {
    core: Arc<TransportCore>,
    workers: Mutex<Vec<Worker>>,
    retiring: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicUsize,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn QueueConnector>,
        serializer: Option<Arc<dyn MessageSerializer>>,
        observer: Arc<dyn TransportObserver>,
    ) -> Self {
        let producers = ProducerProvider::new(
            Arc::clone(&connector),
            config.is_transactional,
            config.pool.clone(),
        );
        let consumers = ConsumerProvider::new(
            Arc::clone(&connector),
            config.is_transactional,
            config.pool.clone(),
        );
        let ledger = RetryLedger::new(config.max_retries);

        Self {
            core: Arc::new(TransportCore {
                config,
                connector,
                serializer,
                observer,
                producers,
                consumers,
                ledger,
                addresses: RwLock::new(None),
            }),
            workers: Mutex::new(Vec::new()),
            retiring: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.core.config
    }

    /// Input queue name as configured
    pub fn address(&self) -> &str {
        &self.core.config.input_queue
    }

    pub fn is_started(&self) -> bool {
        self.core.addresses.read().is_some()
    }

    pub fn retry_ledger(&self) -> &RetryLedger {
        &self.core.ledger
    }

    /// Resolve the configured queues, purge the input queue if requested and
    /// start the configured number of workers.
    ///
    /// # Errors
    ///
    /// - [`TransportError::AlreadyStarted`] when called twice without `stop`
    /// - [`TransportError::MissingSerializer`] when bodies must be decoded but
    ///   no serializer was supplied
    /// - [`TransportError::Configuration`] for unresolvable destinations
    pub async fn start(&self) -> Result<(), TransportError> {
        let config = &self.core.config;
        config.validate()?;

        if self.core.serializer.is_none() && !config.skip_deserialization {
            return Err(TransportError::MissingSerializer);
        }

        let addresses = Arc::new(Addresses::resolve(config)?);
        {
            let mut current = self.core.addresses.write();
            if current.is_some() {
                return Err(TransportError::AlreadyStarted);
            }
            *current = Some(Arc::clone(&addresses));
        }

        if config.purge_on_startup {
            if let Err(e) = purge(self.core.connector.as_ref(), &addresses.input).await {
                *self.core.addresses.write() = None;
                return Err(e.into());
            }
        }

        self.change_number_of_worker_threads(config.number_of_worker_threads)?;

        info!(
            input = %addresses.input,
            error = %addresses.error,
            workers = config.number_of_worker_threads,
            transactional = config.is_transactional,
            "Transport started"
        );
        Ok(())
    }

    /// Signal every worker and wait for their current cycles to finish
    pub async fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut handles = std::mem::take(&mut *self.retiring.lock());

        for worker in workers {
            worker.stop.send_replace(true);
            handles.push(worker.handle);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker terminated abnormally");
            }
        }

        *self.core.addresses.write() = None;
        info!("Transport stopped");
    }

    /// Release every pooled connection. Call after `stop`.
    pub fn dispose(&self) {
        self.core.producers.dispose();
        self.core.consumers.dispose();
    }

    /// Send `message` to `destination`, an alias or destination string.
    ///
    /// With a transaction on a transactional transport the send only takes
    /// effect when the transaction commits. The assigned id is written back
    /// to `message.id`.
    pub async fn send(
        &self,
        message: &mut TransportMessage,
        destination: &str,
        transaction: Option<&Transaction>,
    ) -> Result<MessageId, TransportError> {
        self.core.send(message, destination, transaction).await
    }

    /// Put `message` on the back of the input queue, which may break ordering
    pub async fn receive_message_later(
        &self,
        message: &mut TransportMessage,
    ) -> Result<MessageId, TransportError> {
        let input = self.core.config.input_queue.clone();
        self.core.send(message, &input, None).await
    }

    /// Messages currently waiting on the input queue
    pub async fn number_of_pending_messages(&self) -> Result<usize, TransportError> {
        let input = self.core.config.destination(&self.core.config.input_queue)?;
        Ok(self.core.connector.queue_depth(&input).await?)
    }

    /// Workers currently running
    pub fn number_of_worker_threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Start or stop workers until `target` are running.
    ///
    /// Stopped workers finish their current cycle; `stop` waits for them.
    pub fn change_number_of_worker_threads(&self, target: usize) -> Result<(), TransportError> {
        let addresses = self.core.addresses().ok_or(TransportError::NotStarted)?;

        let mut workers = self.workers.lock();
        let current = workers.len();

        if target < current {
            let mut retiring = self.retiring.lock();
            for worker in workers.drain(target..) {
                debug!(worker = worker.id, "Stopping worker");
                worker.stop.send_replace(true);
                retiring.push(worker.handle);
            }
            retiring.retain(|handle| !handle.is_finished());
        }

        for _ in current..target {
            let id = self.next_worker.fetch_add(1, Ordering::SeqCst);
            let (stop, stop_signal) = watch::channel(false);
            let handle = tokio::spawn(run_worker(
                Arc::clone(&self.core),
                Arc::clone(&addresses),
                id,
                stop_signal,
            ));
            workers.push(Worker { id, stop, handle });
        }

        if target != current {
            info!(from = current, to = target, "Changed number of workers");
        }
        Ok(())
    }

    /// Run one receive cycle on the calling task
    pub async fn receive_from_queue(&self) -> Result<CycleOutcome, TransportError> {
        let addresses = self.core.addresses().ok_or(TransportError::NotStarted)?;
        Ok(self.core.run_cycle(&addresses).await)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.stop.send_replace(true);
        }
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
