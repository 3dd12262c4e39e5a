//! End-to-end scenarios for consumers on the push-subscription broker

mod common;

use common::{config_for, eventually, queue, PushHarness, Recorder, ScenarioHandler};
use queue_app::{AppBuilder, AppError, Reply};
use queue_runtime::{Backend, Message, QueueError, CORRELATION_ID_ATTRIBUTES};
use serde_json::json;
use tokio_test::assert_ok;

/// Handled messages are acked; replies are published to the reply subject
#[tokio::test]
async fn test_success_acked_and_reply_published() {
    let harness = PushHarness::new(&["requests"]).await;
    let handle = harness.start().await;

    harness
        .publish(
            "requests",
            Message::new(r#"{"action":"process"}"#.into())
                .with_reply_to("requests.reply".to_string())
                .with_correlation_id("abc-1".to_string()),
        )
        .await;
    let broker = harness.broker.clone();
    eventually("ack", || broker.acked_count(&queue("requests")) == 1).await;

    assert_eq!(harness.broker.pending_count(&queue("requests.reply")), 1);
    assert_eq!(harness.broker.unacked_count(&queue("requests")), 0);
    assert_eq!(harness.broker.dead_letter_count(&queue("requests")), 0);

    let report = harness.app.stop().await;
    assert_ok!(handle.wait().await);
    assert!(report.is_clean());
}

/// Error replies are published and the message is terminated, never redelivered
#[tokio::test]
async fn test_failure_terminated_with_reason() {
    let harness = PushHarness::new(&["requests"]).await;
    let handle = harness.start().await;

    harness
        .publish(
            "requests",
            Message::new(r#"{"action":"fail"}"#.into())
                .with_reply_to("requests.reply".to_string()),
        )
        .await;
    let broker = harness.broker.clone();
    eventually("term", || broker.dead_letter_count(&queue("requests")) == 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(harness.recorder.calls(), 1);
    assert_eq!(harness.broker.pending_count(&queue("requests")), 0);
    assert_eq!(harness.broker.acked_count(&queue("requests")), 0);
    assert_eq!(harness.broker.dead_lettered(&queue("requests"))[0].1, "boom");
    assert_eq!(harness.broker.pending_count(&queue("requests.reply")), 1);

    harness.app.stop().await;
    assert_ok!(handle.wait().await);
}

/// The reply carries the request's correlation id as metadata and in the body
#[tokio::test]
async fn test_reply_correlation_on_broker() {
    let harness = PushHarness::new(&["requests", "requests.reply"]).await;
    let handle = harness.start().await;

    harness
        .publish(
            "requests",
            Message::new(r#"{"action":"process"}"#.into())
                .with_reply_to("requests.reply".to_string())
                .with_attribute("correlation-id".to_string(), "hdr-5".to_string()),
        )
        .await;

    // The reply subject is consumed too, so the echo handler sees the envelope
    let recorder = harness.recorder.clone();
    eventually("reply consumed", || recorder.finished() == 2).await;
    harness.app.stop().await;
    assert_ok!(handle.wait().await);

    let invocations = harness.recorder.invocations();
    let request = invocations.iter().find(|i| i.queue == "requests").unwrap();
    let reply = invocations
        .iter()
        .find(|i| i.queue == "requests.reply")
        .unwrap();

    assert_eq!(request.correlation_id, "hdr-5");
    assert_eq!(reply.correlation_id, "hdr-5");
    assert!(CORRELATION_ID_ATTRIBUTES.contains(&"correlation-id"));

    let envelope: Reply = serde_json::from_value(reply.content.clone()).unwrap();
    assert!(envelope.is_success());
    assert_eq!(envelope.correlation_id(), "hdr-5");
    assert_eq!(reply.content["data"], json!({"success": true}));
}

/// Backlog published before start is delivered in order once subscribed
#[tokio::test]
async fn test_backlog_delivered_on_subscribe() {
    let harness = PushHarness::new(&["events"]).await;
    for i in 0..3 {
        harness
            .publish("events", Message::new(format!(r#"{{"n":{}}}"#, i).into()))
            .await;
    }

    let handle = harness.start().await;
    let recorder = harness.recorder.clone();
    eventually("backlog", || recorder.finished() == 3).await;
    harness.app.stop().await;
    assert_ok!(handle.wait().await);

    let order: Vec<i64> = harness
        .recorder
        .invocations()
        .iter()
        .map(|i| i.content["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert_eq!(harness.broker.acked_count(&queue("events")), 3);
}

/// A second application cannot take over an active subscription
#[tokio::test]
async fn test_active_subscription_blocks_second_start() {
    let harness = PushHarness::new(&["events"]).await;
    let handle = harness.start().await;

    let rival = AppBuilder::new(config_for(&["events"]), Recorder::default())
        .backend(Backend::push(harness.broker.clone()))
        .handler("events", ScenarioHandler)
        .build()
        .await
        .unwrap();
    let result = rival.start().await;

    assert!(matches!(
        result,
        Err(AppError::Queue(QueueError::SubscriptionActive { .. }))
    ));

    harness.app.stop().await;
    assert_ok!(handle.wait().await);
}
