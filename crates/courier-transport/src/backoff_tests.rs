//! Tests for the receive back-off sequence.

use super::*;

// ============================================================================
// Delay sequence
// ============================================================================

#[test]
fn test_default_sequence_caps_at_last_delay() {
    let mut backoff = ReceiveBackoff::default();

    let delays: Vec<_> = (0..7).map(|_| backoff.next_delay()).collect();

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ]
    );
}

#[test]
fn test_reset_starts_over() {
    let mut backoff = ReceiveBackoff::default();
    backoff.next_delay();
    backoff.next_delay();
    assert_eq!(backoff.attempts(), 2);

    backoff.reset();

    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.next_delay(), Duration::from_secs(1));
}

#[test]
fn test_attempts_stop_growing_at_last_step() {
    let mut backoff = ReceiveBackoff::new(vec![Duration::from_millis(1)]);

    backoff.next_delay();
    backoff.next_delay();

    assert_eq!(backoff.attempts(), 1);
}

#[test]
fn test_empty_sequence_never_waits() {
    let mut backoff = ReceiveBackoff::new(Vec::new());

    assert_eq!(backoff.next_delay(), Duration::ZERO);
    assert_eq!(backoff.attempts(), 0);
}

// ============================================================================
// Waiting
// ============================================================================

/// Verify that wait sleeps for the current step.
#[tokio::test(start_paused = true)]
async fn test_wait_sleeps_for_delay() {
    let mut backoff = ReceiveBackoff::default();
    let started = tokio::time::Instant::now();

    backoff.wait().await;
    backoff.wait().await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6));
    assert!(elapsed < Duration::from_secs(7));
}
