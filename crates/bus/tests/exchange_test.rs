//! Integration tests for the deliverable exchange.
//!
//! These tests verify that:
//! - Re-publishing under the same key supersedes the latest value
//! - Fetching a key that was never published yields nothing
//! - Oversized deliverables are rejected, not truncated

#![forbid(clippy::unwrap_used)]
#![forbid(clippy::expect_used)]

use std::sync::Arc;

use serde_json::json;

use conduit_bus::{
    BusError, DeliverableExchange, InMemoryBus, MessageBus, StreamIdentity, StreamRegistry,
};
use conduit_core::{DeliverableMetadata, RetentionSettings};

async fn exchange_with_agent(agent: &str, limit: usize) -> Result<(InMemoryBus, DeliverableExchange), BusError> {
    let bus = InMemoryBus::new();
    let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());
    let registry = StreamRegistry::new(Arc::clone(&shared), RetentionSettings::default());
    registry.ensure_stream(&StreamIdentity::agent(agent)?).await?;
    Ok((bus, DeliverableExchange::new(shared, limit)))
}

/// # GIVEN
/// A deliverable published twice under the same key
///
/// # WHEN
/// The latest value is fetched
///
/// # THEN
/// The second payload is returned and both messages remain in history
#[tokio::test]
async fn test_latest_publish_wins() -> Result<(), Box<dyn std::error::Error>> {
    let (bus, exchange) = exchange_with_agent("cynthia", 1 << 20).await?;

    let first = exchange
        .publish("cynthia", "research", "REQ-1", json!({"v": 1}), DeliverableMetadata::new("cynthia", "research"))
        .await?;
    let second = exchange
        .publish("cynthia", "research", "REQ-1", json!({"v": 2}), DeliverableMetadata::new("cynthia", "research"))
        .await?;

    assert_eq!(first.stream, "DELIVERABLES_CYNTHIA");
    assert!(second.sequence > first.sequence);

    let latest = exchange.fetch_latest("cynthia", "research", "REQ-1").await?;
    assert_eq!(latest.map(|d| d.payload), Some(json!({"v": 2})));
    assert_eq!(bus.messages("DELIVERABLES_CYNTHIA").await.len(), 2);
    Ok(())
}

/// # GIVEN
/// An agent stream with no deliverable for a request
///
/// # WHEN
/// The key is fetched, and a key for an agent with no stream at all
///
/// # THEN
/// Both fetches return nothing rather than an error
#[tokio::test]
async fn test_fetch_never_published_is_none() -> Result<(), Box<dyn std::error::Error>> {
    let (_bus, exchange) = exchange_with_agent("roy", 1 << 20).await?;
    exchange
        .publish("roy", "backend", "REQ-1", json!({}), DeliverableMetadata::new("roy", "backend"))
        .await?;

    assert!(exchange.fetch_latest("roy", "backend", "REQ-2").await?.is_none());
    assert!(exchange.fetch_latest("jen", "frontend", "REQ-1").await?.is_none());
    Ok(())
}

/// # GIVEN
/// A message ceiling of 256 bytes
///
/// # WHEN
/// A larger deliverable is published
///
/// # THEN
/// The publish fails with PayloadTooLarge and nothing is stored
#[tokio::test]
async fn test_oversized_deliverable_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let (bus, exchange) = exchange_with_agent("billy", 256).await?;

    let result = exchange
        .publish("billy", "qa", "REQ-9", json!({"blob": "x".repeat(512)}), DeliverableMetadata::new("billy", "qa"))
        .await;

    match result {
        Err(BusError::PayloadTooLarge { size, limit }) => {
            assert!(size > 512);
            assert_eq!(limit, 256);
        }
        other => return Err(format!("expected PayloadTooLarge, got {other:?}").into()),
    }
    assert!(bus.messages("DELIVERABLES_BILLY").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_invalid_key_token_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let (_bus, exchange) = exchange_with_agent("priya", 1 << 20).await?;
    let result = exchange
        .publish("priya", "stats", "REQ 1", json!({}), DeliverableMetadata::new("priya", "stats"))
        .await;
    assert!(matches!(result, Err(BusError::InvalidSubjectToken { .. })));
    Ok(())
}
