//! Fetch failure handling on the pull backend

mod common;

use common::{config_for, eventually, queue, PullHarness};
use queue_app::{AppError, Backoff, BackoffConfig};
use queue_runtime::Message;
use std::time::{Duration, Instant};
use tokio_test::assert_ok;

fn fast_backoff(max_consecutive_failures: u32) -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 20,
        max_delay_ms: 60,
        max_consecutive_failures,
    }
}

/// Nth failure waits min(base * 2^(N-1), cap)
#[test]
fn test_backoff_schedule() {
    let backoff = Backoff::from_config(&BackoffConfig::default());

    let delays: Vec<u64> = (1..=7)
        .map(|n| backoff.delay_for(n).as_millis() as u64)
        .collect();

    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    assert!(!backoff.is_fatal(4));
    assert!(backoff.is_fatal(5));
}

/// Transient fetch failures are ridden out and messages still flow
#[tokio::test]
async fn test_recovers_from_transient_failures() {
    let mut config = config_for(&["orders"]);
    config.backoff = fast_backoff(5);
    let harness = PullHarness::with_config(config).await;
    harness.provider.inject_receive_failures(3);
    harness.send("orders", Message::new(r#"{"id":1}"#.into())).await;

    let started = Instant::now();
    let handle = harness.start().await;
    let recorder = harness.recorder.clone();
    eventually("handler after recovery", || recorder.finished() == 1).await;

    // 20 + 40 + 60 ms of backoff precede the successful fetch
    assert!(started.elapsed() >= Duration::from_millis(120));

    // The success reset the count: three more failures stay below the ceiling
    harness.provider.inject_receive_failures(3);
    harness.send("orders", Message::new(r#"{"id":2}"#.into())).await;
    eventually("second handler", || recorder.finished() == 2).await;

    let report = harness.app.stop().await;
    assert_ok!(handle.wait().await);
    assert!(report.is_clean());
}

/// Reaching the failure ceiling stops the consumer and surfaces the error
#[tokio::test]
async fn test_failure_ceiling_ends_run() {
    let mut config = config_for(&["orders"]);
    config.backoff = fast_backoff(3);
    let harness = PullHarness::with_config(config).await;
    harness.provider.inject_receive_failures(10);

    let handle = harness.start().await;
    let result = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("loop should give up");

    match result {
        Err(AppError::PollingFailed {
            queue: name,
            failures,
            last_error,
        }) => {
            assert_eq!(name, "orders");
            assert_eq!(failures, 3);
            assert!(last_error.contains("injected"));
        }
        other => panic!("expected PollingFailed, got {:?}", other),
    }

    let report = harness.app.stop().await;
    assert!(report.drained);
    assert_eq!(harness.recorder.calls(), 0);
    assert_eq!(harness.provider.queue_depth(&queue("orders")), 0);
}
