//! Tests for the in-memory push broker.

use super::*;
use bytes::Bytes;
use std::time::Duration;
use tokio_test::assert_ok;

fn subject(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

async fn next_within(subscription: &mut Box<dyn Subscription>) -> Option<ReceivedMessage> {
    tokio::time::timeout(Duration::from_secs(2), subscription.next_message())
        .await
        .expect("subscription should yield within the timeout")
}

// ============================================================================
// Subscription Tests
// ============================================================================

mod subscription {
    use super::*;

    /// Verify that messages published before subscribing are delivered in order.
    #[tokio::test]
    async fn test_backlog_delivered_in_order() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders.created");
        broker.send_message(&orders, Message::new("a".into())).await.unwrap();
        broker.send_message(&orders, Message::new("b".into())).await.unwrap();

        let mut sub = broker.subscribe(&orders, None).await.unwrap();

        let first = next_within(&mut sub).await.unwrap();
        let second = next_within(&mut sub).await.unwrap();
        assert_eq!(first.body, Bytes::from("a"));
        assert_eq!(second.body, Bytes::from("b"));
        assert_eq!(broker.unacked_count(&orders), 2);
        assert_eq!(broker.pending_count(&orders), 0);
    }

    /// Verify that a waiting subscriber receives a message published later.
    #[tokio::test]
    async fn test_subscriber_wakes_on_publish() {
        let broker = Arc::new(InMemoryBroker::default());
        let orders = subject("orders");
        let mut sub = broker.subscribe(&orders, Some("worker")).await.unwrap();

        let publisher = Arc::clone(&broker);
        let publish_subject = orders.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .send_message(&publish_subject, Message::new("late".into()))
                .await
                .unwrap();
        });

        let message = next_within(&mut sub).await.unwrap();
        assert_eq!(message.body, Bytes::from("late"));
        assert_eq!(message.receipt_handle.provider_type(), ProviderType::InMemoryBroker);
    }

    /// Verify that only one subscription per subject may be active.
    #[tokio::test]
    async fn test_second_subscription_rejected() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");
        let mut first = broker.subscribe(&orders, None).await.unwrap();

        let second = broker.subscribe(&orders, None).await;
        assert!(matches!(second, Err(QueueError::SubscriptionActive { .. })));

        first.close().await.unwrap();
        assert!(!broker.has_subscriber(&orders));
        assert_ok!(broker.subscribe(&orders, None).await);
    }

    /// Verify that dropping a subscription frees the subject.
    #[tokio::test]
    async fn test_drop_releases_subject() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");

        {
            let _sub = broker.subscribe(&orders, None).await.unwrap();
            assert!(broker.has_subscriber(&orders));
        }

        assert!(!broker.has_subscriber(&orders));
    }

    /// Verify that a closed subscription yields no further messages.
    #[tokio::test]
    async fn test_closed_subscription_ends() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");
        broker.send_message(&orders, Message::new("x".into())).await.unwrap();
        let mut sub = broker.subscribe(&orders, None).await.unwrap();

        sub.close().await.unwrap();

        assert!(sub.next_message().await.is_none());
        assert_eq!(broker.pending_count(&orders), 1);
    }

    /// Verify that dropping a pending next_message future loses nothing.
    #[tokio::test]
    async fn test_next_message_is_cancel_safe() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");
        let mut sub = broker.subscribe(&orders, None).await.unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), sub.next_message()).await;
        assert!(timed_out.is_err());

        broker.send_message(&orders, Message::new("kept".into())).await.unwrap();
        let message = next_within(&mut sub).await.unwrap();
        assert_eq!(message.body, Bytes::from("kept"));
    }

    /// Verify that closing the broker ends active subscriptions.
    #[tokio::test]
    async fn test_broker_close_ends_subscription() {
        let broker = Arc::new(InMemoryBroker::default());
        let orders = subject("orders");
        let mut sub = broker.subscribe(&orders, None).await.unwrap();

        let closer = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close().await.unwrap();
        });

        assert!(next_within(&mut sub).await.is_none());
        assert!(broker.is_closed());
    }
}

// ============================================================================
// Acknowledgment Tests
// ============================================================================

mod acknowledgment {
    use super::*;

    async fn deliver_one(
        broker: &InMemoryBroker,
        orders: &QueueName,
    ) -> (Box<dyn Subscription>, ReceivedMessage) {
        broker
            .send_message(orders, Message::new("body".into()))
            .await
            .unwrap();
        let mut sub = broker.subscribe(orders, None).await.unwrap();
        let message = next_within(&mut sub).await.unwrap();
        (sub, message)
    }

    /// Verify that ack removes the message for good.
    #[tokio::test]
    async fn test_ack() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");
        let (_sub, message) = deliver_one(&broker, &orders).await;

        assert_ok!(broker.complete_message(&message.receipt_handle).await);

        assert_eq!(broker.acked_count(&orders), 1);
        assert_eq!(broker.unacked_count(&orders), 0);
        let again = broker.complete_message(&message.receipt_handle).await;
        assert!(matches!(again, Err(QueueError::MessageNotFound { .. })));
    }

    /// Verify that nak redelivers the same message immediately.
    #[tokio::test]
    async fn test_nak_redelivers() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");
        let (mut sub, message) = deliver_one(&broker, &orders).await;

        assert_ok!(broker.abandon_message(&message.receipt_handle).await);

        let redelivered = next_within(&mut sub).await.unwrap();
        assert_eq!(redelivered.message_id, message.message_id);
        assert_eq!(redelivered.delivery_count, 2);
    }

    /// Verify that term parks the message without redelivery.
    #[tokio::test]
    async fn test_term_is_terminal() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");
        let (mut sub, message) = deliver_one(&broker, &orders).await;

        assert_ok!(
            broker
                .dead_letter_message(&message.receipt_handle, "invalid payload")
                .await
        );

        let nothing = tokio::time::timeout(Duration::from_millis(20), sub.next_message()).await;
        assert!(nothing.is_err());
        assert_eq!(
            broker.dead_lettered(&orders),
            vec![(message.message_id.clone(), "invalid payload".to_string())]
        );
    }

    /// Verify that acknowledging after close fails.
    #[tokio::test]
    async fn test_ack_after_close() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");
        let (_sub, message) = deliver_one(&broker, &orders).await;

        broker.close().await.unwrap();

        let result = broker.complete_message(&message.receipt_handle).await;
        assert!(matches!(result, Err(QueueError::ConnectionClosed { .. })));
    }
}

// ============================================================================
// Limits
// ============================================================================

mod limits {
    use super::*;

    #[tokio::test]
    async fn test_max_pending_enforced() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            max_pending: Some(1),
        });
        let orders = subject("orders");

        assert_ok!(broker.send_message(&orders, Message::new("1".into())).await);
        let result = broker.send_message(&orders, Message::new("2".into())).await;
        match result {
            Err(QueueError::ProviderError { code, .. }) => assert_eq!(code, "SubjectFull"),
            other => panic!("expected SubjectFull, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_verify_creates_subject() {
        let broker = InMemoryBroker::default();
        let orders = subject("orders");

        assert_ok!(broker.verify_queue(&orders).await);
        assert_eq!(broker.pending_count(&orders), 0);
    }
}
