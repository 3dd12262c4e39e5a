//! Tests for message types.

use super::*;

fn received(attributes: HashMap<String, String>) -> ReceivedMessage {
    let queue = QueueName::new("orders".to_string()).unwrap();
    ReceivedMessage {
        message_id: MessageId::new(),
        body: "test".into(),
        attributes,
        correlation_id: Some("corr-123".to_string()),
        reply_to: Some("reply:abc".to_string()),
        receipt_handle: ReceiptHandle::new(
            "receipt".to_string(),
            queue,
            ProviderType::InMemoryQueue,
        ),
        delivery_count: 1,
        delivered_at: Timestamp::now(),
    }
}

#[test]
fn test_queue_name_validation() {
    // Valid names
    assert!(QueueName::new("test-queue".to_string()).is_ok());
    assert!(QueueName::new("orders.created".to_string()).is_ok());
    assert!(QueueName::new("reply:1234".to_string()).is_ok());
    assert!(QueueName::new("a".to_string()).is_ok());

    // Invalid names
    assert!(QueueName::new("".to_string()).is_err());
    assert!(QueueName::new("a".repeat(261)).is_err());
    assert!(QueueName::new("with space".to_string()).is_err());
    assert!(QueueName::new("wild.*".to_string()).is_err());
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::new();
    let id2 = MessageId::new();
    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
    assert!("".parse::<MessageId>().is_err());
}

#[test]
fn test_message_builder() {
    let message = Message::new("test body".into())
        .with_attribute("key".to_string(), "value".to_string())
        .with_correlation_id("corr-123".to_string())
        .with_reply_to("reply:1".to_string());

    assert_eq!(message.attributes.get("key"), Some(&"value".to_string()));
    assert_eq!(message.correlation_id, Some("corr-123".to_string()));
    assert_eq!(message.reply_to, Some("reply:1".to_string()));
}

#[test]
fn test_received_message_to_message() {
    let received = received(HashMap::new());

    let message = received.message();
    assert_eq!(message.correlation_id, Some("corr-123".to_string()));
    assert_eq!(message.reply_to, Some("reply:abc".to_string()));
    assert_eq!(message.body, received.body);
}

#[test]
fn test_attribute_lookup_skips_empty_values() {
    let mut attributes = HashMap::new();
    attributes.insert("correlation-id".to_string(), String::new());
    attributes.insert("correlationId".to_string(), "from-attribute".to_string());
    let received = received(attributes);

    assert_eq!(
        received.attribute(&CORRELATION_ID_ATTRIBUTES),
        Some("from-attribute")
    );
    assert_eq!(received.attribute(&REPLY_TO_ATTRIBUTES), None);
}

#[test]
fn test_timestamp_rfc3339_millis() {
    let ts: Timestamp = "2026-10-18T09:30:00.125Z".parse().unwrap();
    assert_eq!(ts.to_rfc3339_millis(), "2026-10-18T09:30:00.125Z");

    let earlier: Timestamp = "2026-10-18T09:29:59.999Z".parse().unwrap();
    assert!(earlier < ts);
    assert!(earlier.to_rfc3339_millis() < ts.to_rfc3339_millis());
}

#[test]
fn test_receipt_handle_display() {
    let queue = QueueName::new("orders".to_string()).unwrap();
    let receipt = ReceiptHandle::new(
        "abc".to_string(),
        queue.clone(),
        ProviderType::InMemoryBroker,
    );

    assert_eq!(receipt.to_string(), "orders/abc");
    assert_eq!(receipt.queue(), &queue);
    assert_eq!(receipt.provider_type(), ProviderType::InMemoryBroker);
}
