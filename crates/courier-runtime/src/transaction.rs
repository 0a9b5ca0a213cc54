//! Explicit transaction handles with two-phase commit over enlisted participants.
//!
//! A [`Transaction`] is passed to whatever must take part in the unit of work.
//! Participants implement [`EnlistmentNotification`] and are driven through
//! prepare and then commit or rollback when the owner completes the
//! transaction. After the outcome is settled each participant is told
//! about it through [`EnlistmentNotification::transaction_completed`].

use crate::error::TransactionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identity of a transaction, local to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(uuid::Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Isolation level requested for the unit of work.
///
/// Passed through to participants; the in-process coordinator does not
/// interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
    Snapshot,
    Chaos,
    Unspecified,
}

/// Settings for a new transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation_level: IsolationLevel,
    /// Maximum lifetime; checked when the transaction commits
    pub timeout: Option<Duration>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
    InDoubt,
}

/// Final result reported to participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    Aborted,
    InDoubt,
}

/// A participant's answer to prepare
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    Prepared,
    ForceRollback { reason: String },
}

/// Two-phase commit participant.
#[async_trait]
pub trait EnlistmentNotification: Send + Sync {
    async fn prepare(&self) -> Vote;

    async fn commit(&self) -> Result<(), String>;

    async fn rollback(&self);

    /// The coordinator lost track of the outcome after this participant prepared
    async fn in_doubt(&self);

    /// Called exactly once after the outcome is settled, whatever it was
    async fn transaction_completed(&self, outcome: TransactionOutcome);

    /// Participants acknowledging received messages commit after every other
    /// one, so a failed send leaves them in doubt and the message on its queue.
    fn commits_last(&self) -> bool {
        false
    }
}

struct TransactionState {
    status: TransactionStatus,
    completing: bool,
    participants: Vec<Arc<dyn EnlistmentNotification>>,
}

struct TransactionInner {
    id: TransactionId,
    options: TransactionOptions,
    started: Instant,
    state: Mutex<TransactionState>,
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.completing || state.status != TransactionStatus::Active {
            return;
        }

        let participants = std::mem::take(&mut state.participants);
        if participants.is_empty() {
            return;
        }

        warn!(
            transaction_id = %self.id,
            participants = participants.len(),
            "Transaction dropped without completing; rolling back"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(abort_participants(participants));
            }
            Err(_) => {
                warn!(
                    transaction_id = %self.id,
                    "No runtime available to roll back enlisted participants"
                );
            }
        }
    }
}

async fn abort_participants(participants: Vec<Arc<dyn EnlistmentNotification>>) {
    for participant in &participants {
        participant.rollback().await;
    }
    for participant in &participants {
        participant.transaction_completed(TransactionOutcome::Aborted).await;
    }
}

/// Handle to a unit of work. Clones share the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Transaction {
    pub fn begin(options: TransactionOptions) -> Self {
        let id = TransactionId::new();
        debug!(
            transaction_id = %id,
            isolation_level = ?options.isolation_level,
            timeout = ?options.timeout,
            "Transaction started"
        );

        Self {
            inner: Arc::new(TransactionInner {
                id,
                options,
                started: Instant::now(),
                state: Mutex::new(TransactionState {
                    status: TransactionStatus::Active,
                    completing: false,
                    participants: Vec::new(),
                }),
            }),
        }
    }

    pub fn local_id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.inner.options
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    pub fn participant_count(&self) -> usize {
        self.inner.state.lock().participants.len()
    }

    /// Register a participant for the two-phase protocol.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::AlreadyCompleted`] once commit or rollback
    /// has begun.
    pub fn enlist(
        &self,
        participant: Arc<dyn EnlistmentNotification>,
    ) -> Result<(), TransactionError> {
        let mut state = self.inner.state.lock();
        if state.completing || state.status != TransactionStatus::Active {
            return Err(TransactionError::AlreadyCompleted { id: self.inner.id });
        }
        state.participants.push(participant);
        Ok(())
    }

    fn take_participants(&self) -> Result<Vec<Arc<dyn EnlistmentNotification>>, TransactionError> {
        let mut state = self.inner.state.lock();
        if state.completing || state.status != TransactionStatus::Active {
            return Err(TransactionError::AlreadyCompleted { id: self.inner.id });
        }
        state.completing = true;
        Ok(std::mem::take(&mut state.participants))
    }

    fn settle(&self, status: TransactionStatus) {
        let mut state = self.inner.state.lock();
        state.status = status;
        state.completing = false;
    }

    /// Prepare every participant, then commit them all if every one voted
    /// prepared, otherwise roll them all back.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::AlreadyCompleted`] when called twice
    /// - [`TransactionError::TimedOut`] when the transaction outlived its timeout;
    ///   participants are rolled back
    /// - [`TransactionError::Aborted`] when a participant refused to prepare
    /// - [`TransactionError::InDoubt`] when a participant failed to commit after
    ///   every participant prepared
    pub async fn commit(&self) -> Result<(), TransactionError> {
        let id = self.inner.id;
        let participants = self.take_participants()?;

        let elapsed = self.inner.started.elapsed();
        if let Some(timeout) = self.inner.options.timeout {
            if elapsed > timeout {
                warn!(transaction_id = %id, ?elapsed, ?timeout, "Transaction timed out; rolling back");
                self.finish_aborted(&participants).await;
                return Err(TransactionError::TimedOut {
                    id,
                    elapsed,
                    timeout,
                });
            }
        }

        for participant in &participants {
            if let Vote::ForceRollback { reason } = participant.prepare().await {
                warn!(transaction_id = %id, reason = %reason, "Participant refused to prepare; rolling back");
                self.finish_aborted(&participants).await;
                return Err(TransactionError::Aborted { id, reason });
            }
        }

        let mut ordered: Vec<&Arc<dyn EnlistmentNotification>> = participants.iter().collect();
        ordered.sort_by_key(|participant| participant.commits_last());

        let mut failure = None;
        for (index, participant) in ordered.iter().enumerate() {
            if let Err(reason) = participant.commit().await {
                warn!(transaction_id = %id, reason = %reason, "Participant failed to commit");
                for remaining in &ordered[index + 1..] {
                    remaining.in_doubt().await;
                }
                failure = Some(reason);
                break;
            }
        }

        match failure {
            None => {
                self.settle(TransactionStatus::Committed);
                notify_completed(&participants, TransactionOutcome::Committed).await;
                debug!(transaction_id = %id, participants = participants.len(), "Transaction committed");
                Ok(())
            }
            Some(reason) => {
                self.settle(TransactionStatus::InDoubt);
                notify_completed(&participants, TransactionOutcome::InDoubt).await;
                Err(TransactionError::InDoubt { id, reason })
            }
        }
    }

    /// Roll back every participant.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::AlreadyCompleted`] when the transaction has
    /// already been completed.
    pub async fn rollback(&self) -> Result<(), TransactionError> {
        let participants = self.take_participants()?;
        self.finish_aborted(&participants).await;
        debug!(transaction_id = %self.inner.id, "Transaction rolled back");
        Ok(())
    }

    async fn finish_aborted(&self, participants: &[Arc<dyn EnlistmentNotification>]) {
        for participant in participants {
            participant.rollback().await;
        }
        self.settle(TransactionStatus::Aborted);
        notify_completed(participants, TransactionOutcome::Aborted).await;
    }
}

async fn notify_completed(
    participants: &[Arc<dyn EnlistmentNotification>],
    outcome: TransactionOutcome,
) {
    for participant in participants {
        participant.transaction_completed(outcome).await;
    }
}

/// Run `work` inside a new transaction: commit when it succeeds, roll back
/// when it fails.
///
/// The transaction is handed to `work` so that sends and receives can join it.
pub async fn run_in_transaction<F, Fut, T, E>(options: TransactionOptions, work: F) -> Result<T, E>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<TransactionError>,
{
    let transaction = Transaction::begin(options);
    match work(transaction.clone()).await {
        Ok(value) => {
            transaction.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = transaction.rollback().await {
                info!(
                    transaction_id = %transaction.local_id(),
                    error = %rollback_error,
                    "Transaction was already completed by the work it ran"
                );
            }
            Err(error)
        }
    }
}

#[cfg(test)]
#[path = "transaction_tests.rs"]
mod tests;
