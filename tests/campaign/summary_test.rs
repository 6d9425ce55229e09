//! Summary aggregation and rendering.

use std::time::Duration;

use campaigner::campaign::summary::SummaryBuilder;
use campaigner::delivery::{
    DeliveryAttempt, DeliveryOutcome, ErrorClass, OutcomeStatus, OutgoingMessage, SkipReason,
};

fn message(recipient: &str) -> OutgoingMessage {
    OutgoingMessage::new("spring", recipient, "s", "<p>b</p>", "b")
}

fn delivered(recipient: &str) -> DeliveryOutcome {
    DeliveryOutcome::from_history(
        &message(recipient),
        OutcomeStatus::Delivered,
        None,
        vec![DeliveryAttempt::begin(1).succeed("msg_1")],
        Duration::ZERO,
    )
}

fn skipped(recipient: &str, reason: SkipReason) -> DeliveryOutcome {
    DeliveryOutcome::skipped(&message(recipient), reason, Vec::new(), Duration::ZERO)
}

fn failed(recipient: &str, class: ErrorClass) -> DeliveryOutcome {
    DeliveryOutcome::from_history(
        &message(recipient),
        OutcomeStatus::Failed,
        None,
        vec![DeliveryAttempt::begin(1).fail(class, "boom")],
        Duration::ZERO,
    )
}

#[test]
fn counts_each_status_and_reason() {
    let mut builder = SummaryBuilder::new("spring", 6, false);
    builder.record(&delivered("a@x.io"));
    builder.record(&delivered("b@x.io"));
    builder.record(&failed("c@x.io", ErrorClass::Transient));
    builder.record(&skipped("d@x.io", SkipReason::QuotaExhausted));
    builder.record(&skipped("e@x.io", SkipReason::QuotaExhausted));
    builder.record_resumed(&delivered("f@x.io"));
    let summary = builder.finish(Duration::from_secs(2));

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.attempts, 3);
    assert_eq!(summary.skipped_for(SkipReason::QuotaExhausted), 2);
    assert_eq!(summary.skipped_for(SkipReason::Cancelled), 0);
    assert!(summary.is_complete());
    assert_eq!(
        summary.error_reasons.get(&ErrorClass::Transient),
        Some(&vec!["boom".to_owned()])
    );
}

#[test]
fn display_is_one_line() {
    let mut builder = SummaryBuilder::new("spring", 2, true);
    builder.record(&delivered("a@x.io"));
    builder.record(&skipped("b@x.io", SkipReason::Suppressed));
    let rendered = builder.finish(Duration::from_millis(1500)).to_string();

    assert_eq!(
        rendered,
        "campaign spring (dry run): 1 delivered, 0 failed, 1 skipped of 2 in 1.5s"
    );
}

#[test]
fn serializes_reason_maps_with_snake_case_keys() {
    let mut builder = SummaryBuilder::new("spring", 1, false);
    builder.record(&skipped("a@x.io", SkipReason::CircuitOpen));
    let json = serde_json::to_value(builder.finish(Duration::ZERO)).expect("serialize");

    assert_eq!(json["skipped_by_reason"]["circuit_open"], 1);
    assert_eq!(json["campaign_id"], "spring");
}
