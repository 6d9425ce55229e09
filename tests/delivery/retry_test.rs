//! Retry decisions and backoff bounds.

use std::time::Duration;

use campaigner::delivery::retry::{RetryDecision, RetryPolicy};
use campaigner::delivery::{DeliveryAttempt, ErrorClass};

fn policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30)).with_jitter(0.0)
}

#[test]
fn transient_failures_back_off_then_fail() {
    let policy = policy();
    let first = DeliveryAttempt::begin(1).fail(ErrorClass::Transient, "503");
    let second = DeliveryAttempt::begin(2).fail(ErrorClass::Transient, "503");
    let third = DeliveryAttempt::begin(3).fail(ErrorClass::Transient, "503");

    assert_eq!(
        policy.decide(&first),
        RetryDecision::RetryAfter(Duration::from_secs(1))
    );
    assert_eq!(
        policy.decide(&second),
        RetryDecision::RetryAfter(Duration::from_secs(2))
    );
    assert_eq!(policy.decide(&third), RetryDecision::FailPermanently);
}

#[test]
fn permanent_failure_is_never_retried() {
    let attempt = DeliveryAttempt::begin(1).fail(ErrorClass::Permanent, "422 invalid recipient");
    assert_eq!(policy().decide(&attempt), RetryDecision::FailPermanently);
}

#[test]
fn success_stops() {
    let attempt = DeliveryAttempt::begin(2).succeed("msg_1");
    assert_eq!(policy().decide(&attempt), RetryDecision::Succeed);
}

#[test]
fn provider_retry_after_raises_delay() {
    let attempt = DeliveryAttempt::begin(1)
        .fail(ErrorClass::Transient, "429")
        .with_retry_after(Some(Duration::from_secs(12)));
    assert_eq!(
        policy().decide(&attempt),
        RetryDecision::RetryAfter(Duration::from_secs(12))
    );
}

#[test]
fn jittered_backoff_stays_within_bounds() {
    let policy = RetryPolicy::new(10, Duration::from_secs(2), Duration::from_secs(60));
    for _ in 0..200 {
        let delay = policy.backoff(2);
        assert!(delay >= Duration::from_millis(3190), "too short: {delay:?}");
        assert!(delay <= Duration::from_millis(4810), "too long: {delay:?}");
    }
}

#[test]
fn single_attempt_policy_never_retries() {
    let policy = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));
    assert_eq!(policy.max_attempts(), 1);
    let attempt = DeliveryAttempt::begin(1).fail(ErrorClass::Transient, "timeout");
    assert_eq!(policy.decide(&attempt), RetryDecision::FailPermanently);
}
