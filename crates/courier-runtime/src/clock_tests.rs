//! Tests for the overridable clock.

use super::*;
use serial_test::serial;

/// Verify that a frozen clock stops moving.
#[test]
#[serial]
fn test_freeze_stops_time() {
    Clock::freeze();
    let first = Clock::now();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = Clock::now();
    Clock::reset();

    assert_eq!(first, second);
}

/// Verify that advancing a frozen clock moves it by exactly the given amount.
#[test]
#[serial]
fn test_advance_by_moves_frozen_clock() {
    let start = Utc::now();
    Clock::freeze_at(start);
    Clock::advance_by(Duration::seconds(30));
    Clock::advance_by(Duration::milliseconds(5));

    assert_eq!(Clock::now(), start + Duration::milliseconds(30_005));
    Clock::reset();
}

/// Verify that reset returns to the system clock.
#[test]
#[serial]
fn test_reset_restores_system_time() {
    Clock::freeze_at(Utc::now() - Duration::days(1));
    assert!(Clock::is_frozen());

    Clock::reset();

    assert!(!Clock::is_frozen());
    assert!(Utc::now() - Clock::now() < Duration::seconds(1));
}
