//! Tests for the expiring key/value store.

use super::*;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_set_then_get() {
    let store = InMemoryKeyValueStore::new();

    store
        .set_with_expiry("reply:1", "{\"ok\":true}".to_string(), Duration::from_secs(300))
        .await
        .unwrap();

    let value = store.get("reply:1").await.unwrap();
    assert_eq!(value.as_deref(), Some("{\"ok\":true}"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_missing_key_reads_none() {
    let store = InMemoryKeyValueStore::new();
    assert_eq!(store.get("nope").await.unwrap(), None);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_set_overwrites() {
    let store = InMemoryKeyValueStore::new();
    let ttl = Duration::from_secs(60);

    store.set_with_expiry("k", "first".to_string(), ttl).await.unwrap();
    store.set_with_expiry("k", "second".to_string(), ttl).await.unwrap();

    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("second"));
}

#[tokio::test]
async fn test_expired_key_reads_none() {
    let store = InMemoryKeyValueStore::new();

    store
        .set_with_expiry("short", "v".to_string(), Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(store.get("short").await.unwrap(), None);
    assert!(store.ttl("short").is_none());
}

#[tokio::test]
async fn test_ttl_reports_remaining_lifetime() {
    let store = InMemoryKeyValueStore::new();
    store
        .set_with_expiry("k", "v".to_string(), Duration::from_secs(300))
        .await
        .unwrap();

    let remaining = store.ttl("k").unwrap();
    assert!(remaining <= Duration::from_secs(300));
    assert!(remaining > Duration::from_secs(290));
}

/// Lifetimes past the clock's range never expire
#[tokio::test]
async fn test_unbounded_ttl_does_not_expire() {
    let store = InMemoryKeyValueStore::new();

    assert_ok!(
        store
            .set_with_expiry("k", "v".to_string(), Duration::from_secs(u64::MAX))
            .await
    );

    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    assert_eq!(store.ttl("k"), Some(Duration::MAX));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_clones_share_state() {
    let store = InMemoryKeyValueStore::new();
    let other = store.clone();

    store
        .set_with_expiry("k", "v".to_string(), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(other.get("k").await.unwrap().as_deref(), Some("v"));
}

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_use() {
    let store = InMemoryKeyValueStore::new();
    assert_ok!(store.ping().await);

    assert_ok!(store.close().await);
    assert_ok!(store.close().await);

    assert!(store.is_closed());
    assert_err!(store.ping().await);
    let result = store.get("k").await;
    assert!(matches!(result, Err(QueueError::ConnectionClosed { .. })));
}
