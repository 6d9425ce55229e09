//! Quota ceilings, window rollover and persistence.

use chrono::{DateTime, TimeZone, Utc};

use campaigner::delivery::quota::{QuotaPeriod, QuotaTracker, QuotaWindow};
use campaigner::delivery::DeliveryError;

fn at(day: u32, hour: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, day, hour, min, 0)
        .single()
        .expect("valid timestamp")
}

#[test]
fn refuses_past_ceiling_without_side_effects() {
    let tracker = QuotaTracker::new_at(5, QuotaPeriod::Daily, at(1, 9, 0));
    for _ in 0..5 {
        assert!(tracker.reserve_at(1, at(1, 9, 1)));
    }
    assert!(!tracker.reserve_at(1, at(1, 9, 2)));
    assert_eq!(tracker.remaining_at(at(1, 9, 2)), 0);
}

#[test]
fn multi_send_reservation_is_all_or_nothing() {
    let tracker = QuotaTracker::new_at(5, QuotaPeriod::Daily, at(1, 9, 0));
    assert!(tracker.reserve_at(3, at(1, 9, 0)));
    assert!(!tracker.reserve_at(3, at(1, 9, 0)));
    assert_eq!(tracker.remaining_at(at(1, 9, 0)), 2);
}

#[test]
fn daily_window_resets_at_midnight() {
    let tracker = QuotaTracker::new_at(2, QuotaPeriod::Daily, at(1, 22, 0));
    assert!(tracker.reserve_at(2, at(1, 23, 59)));
    assert!(!tracker.reserve_at(1, at(1, 23, 59)));
    assert!(tracker.reserve_at(1, at(2, 0, 0)));
    assert_eq!(tracker.remaining_at(at(2, 0, 1)), 1);
}

#[test]
fn hourly_window_resets_each_hour() {
    let tracker = QuotaTracker::new_at(1, QuotaPeriod::Hourly, at(1, 10, 5));
    assert!(tracker.reserve_at(1, at(1, 10, 30)));
    assert!(!tracker.reserve_at(1, at(1, 10, 59)));
    assert!(tracker.reserve_at(1, at(1, 11, 0)));
}

#[test]
fn restore_keeps_the_larger_count() {
    let tracker = QuotaTracker::new_at(10, QuotaPeriod::Daily, at(1, 8, 0));
    assert!(tracker.reserve_at(2, at(1, 8, 0)));

    let stored = QuotaWindow {
        window_start: at(1, 0, 0),
        used: 7,
        ceiling: 10,
    };
    tracker.restore_at(&stored, at(1, 8, 1));
    assert_eq!(tracker.remaining_at(at(1, 8, 1)), 3);

    let lower = QuotaWindow { used: 1, ..stored };
    tracker.restore_at(&lower, at(1, 8, 2));
    assert_eq!(tracker.remaining_at(at(1, 8, 2)), 3);
}

#[test]
fn restore_ignores_stale_window() {
    let tracker = QuotaTracker::new_at(10, QuotaPeriod::Daily, at(2, 8, 0));
    let yesterday = QuotaWindow {
        window_start: at(1, 0, 0),
        used: 10,
        ceiling: 10,
    };
    tracker.restore_at(&yesterday, at(2, 8, 0));
    assert_eq!(tracker.remaining_at(at(2, 8, 0)), 10);
}

#[test]
fn try_reserve_reports_usage() {
    let tracker = QuotaTracker::new(1, QuotaPeriod::Daily);
    assert!(tracker.try_reserve(1).is_ok());
    match tracker.try_reserve(1) {
        Err(DeliveryError::QuotaExceeded { used, ceiling }) => {
            assert_eq!(used, 1);
            assert_eq!(ceiling, 1);
        }
        other => panic!("expected quota exceeded, got {other:?}"),
    }
}
