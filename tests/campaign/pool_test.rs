//! Worker pool used directly, without the dispatcher.

use std::sync::Arc;

use tokio::sync::watch;

use campaigner::campaign::pool::DeliveryWorkerPool;
use campaigner::delivery::sink::InMemorySink;
use campaigner::delivery::{OutcomeStatus, SkipReason};

use crate::support::{config, deps, messages, ScriptedProvider};

#[tokio::test(start_paused = true)]
async fn resolves_every_submitted_message() {
    let provider = Arc::new(ScriptedProvider::accepting());
    let sink = Arc::new(InMemorySink::new());
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut pool = DeliveryWorkerPool::start(
        Arc::new(config("spring")),
        deps(Arc::clone(&provider), sink.clone(), 1000),
        cancel_rx,
    );

    for message in messages("spring", 6) {
        pool.submit(message).expect("pool accepts messages");
    }
    let mut delivered = 0;
    for _ in 0..6 {
        let resolution = pool.next_resolution().await.expect("resolution");
        assert!(resolution.sink_error.is_none());
        if resolution.outcome.status == OutcomeStatus::Delivered {
            delivered += 1;
        }
    }
    pool.shutdown().await;

    assert_eq!(delivered, 6);
    assert_eq!(sink.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn cancelled_pool_skips_without_sending() {
    let provider = Arc::new(ScriptedProvider::accepting());
    let (_cancel_tx, cancel_rx) = watch::channel(true);
    let mut pool = DeliveryWorkerPool::start(
        Arc::new(config("spring").with_concurrency(2)),
        deps(Arc::clone(&provider), Arc::new(InMemorySink::new()), 1000),
        cancel_rx,
    );

    for message in messages("spring", 3) {
        pool.submit(message).expect("pool accepts messages");
    }
    for _ in 0..3 {
        let resolution = pool.next_resolution().await.expect("resolution");
        assert_eq!(resolution.outcome.skip_reason, Some(SkipReason::Cancelled));
        assert!(resolution.outcome.history.is_empty());
    }
    pool.shutdown().await;
    assert_eq!(provider.calls(), 0);
}
