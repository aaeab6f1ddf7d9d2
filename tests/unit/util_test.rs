//! Tests for utility functions

use std::time::Duration;

use chrono::{TimeZone, Utc};
use instance_orchestrator::core::Priority;
use instance_orchestrator::util::{elapsed_between, exponential_backoff, with_jitter};

#[test]
fn test_priority_ordering() {
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::default(), Priority::Normal);
}

#[test]
fn test_backoff_sequence() {
    let base = Duration::from_millis(500);
    let cap = Duration::from_secs(3);
    let delays: Vec<_> = (1..=5).map(|n| exponential_backoff(base, n, cap)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(3),
        ]
    );
}

#[test]
fn test_jitter_stays_within_ratio() {
    let delay = Duration::from_secs(10);
    for _ in 0..100 {
        let jittered = with_jitter(delay, 0.1);
        assert!(jittered >= delay);
        assert!(jittered <= Duration::from_secs(11));
    }
    assert_eq!(with_jitter(delay, 0.0), delay);
}

#[test]
fn test_elapsed_between_saturates() {
    let earlier = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let later = Utc.with_ymd_and_hms(2026, 1, 1, 0, 25, 0).unwrap();
    assert_eq!(elapsed_between(earlier, later), Duration::from_secs(25 * 60));
    assert_eq!(elapsed_between(later, earlier), Duration::ZERO);
}
