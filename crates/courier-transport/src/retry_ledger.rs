//! Failure counts per logical message, shared by every worker.

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use tracing::debug;

/// Number of failed processing attempts recorded for each message.
///
/// Messages are keyed by their stable identity so redeliveries of the same
/// logical message are counted together. Lookups take a shared lock; `clear`
/// only upgrades to exclusive access when there is an entry to remove.
#[derive(Debug)]
pub struct RetryLedger {
    max_retries: u32,
    failures: RwLock<HashMap<String, u32>>,
}

impl RetryLedger {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            failures: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Check whether `message_id` has used up its retries.
    ///
    /// The entry stays until [`RetryLedger::clear`] runs after the message has
    /// actually left the queue, so a failed dead-letter keeps the count.
    pub fn has_reached_max(&self, message_id: &str) -> bool {
        self.failures
            .read()
            .get(message_id)
            .is_some_and(|&count| count >= self.max_retries)
    }

    /// Forget the failures of a message that was processed
    pub fn clear(&self, message_id: &str) {
        let failures = self.failures.upgradable_read();
        if failures.contains_key(message_id) {
            let mut failures = RwLockUpgradableReadGuard::upgrade(failures);
            failures.remove(message_id);
        }
    }

    /// Record one more failure, returning the new count
    pub fn increment(&self, message_id: &str) -> u32 {
        let mut failures = self.failures.write();
        let count = failures.entry(message_id.to_string()).or_insert(0);
        *count += 1;
        debug!(
            message_id = message_id,
            failures = *count,
            max_retries = self.max_retries,
            "Recorded processing failure"
        );
        *count
    }

    /// Failures currently recorded for `message_id`
    pub fn failures(&self, message_id: &str) -> u32 {
        self.failures.read().get(message_id).copied().unwrap_or(0)
    }

    /// Messages with at least one recorded failure
    pub fn len(&self) -> usize {
        self.failures.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.read().is_empty()
    }
}

#[cfg(test)]
#[path = "retry_ledger_tests.rs"]
mod tests;
