//! Receive back-off for workers.
//!
//! A worker whose receive fails waits before trying again. Each consecutive
//! failure moves one step along a fixed delay sequence; the last step repeats
//! until a receive succeeds and the sequence starts over.

use std::time::Duration;
use tracing::debug;

/// Delays used by [`ReceiveBackoff::default`]: 1s, 5s, 10s, 30s, then 60s
pub const DEFAULT_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/// Position in a fixed sequence of back-off delays
///
/// # Examples
///
/// ```rust
/// use courier_transport::backoff::ReceiveBackoff;
/// use std::time::Duration;
///
/// let mut backoff = ReceiveBackoff::default();
///
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// assert_eq!(backoff.next_delay(), Duration::from_secs(5));
///
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ReceiveBackoff {
    delays: Vec<Duration>,
    next: Option<usize>,
}

impl Default for ReceiveBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_DELAYS.to_vec())
    }
}

impl ReceiveBackoff {
    /// Create a back-off over `delays`. An empty sequence never waits.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays, next: None }
    }

    /// Advance one step and return the delay for it
    pub fn next_delay(&mut self) -> Duration {
        let Some(last) = self.delays.len().checked_sub(1) else {
            return Duration::ZERO;
        };

        let step = match self.next {
            Some(current) if current < last => current + 1,
            Some(current) => current,
            None => 0,
        };
        self.next = Some(step);
        self.delays[step]
    }

    /// Sleep for the next delay in the sequence
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Backing off before next receive");
        tokio::time::sleep(delay).await;
    }

    /// Start the sequence over after a successful receive
    pub fn reset(&mut self) {
        self.next = None;
    }

    /// Number of consecutive steps taken since the last reset
    pub fn attempts(&self) -> usize {
        self.next.map_or(0, |step| step + 1)
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
