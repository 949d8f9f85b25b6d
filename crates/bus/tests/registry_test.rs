//! Integration tests for stream provisioning.

#![forbid(clippy::unwrap_used)]
#![forbid(clippy::expect_used)]

use std::sync::Arc;

use conduit_bus::{
    identities_for, InMemoryBus, MessageBus, StreamIdentity, StreamProvision, StreamRegistry,
};
use conduit_core::RetentionSettings;

/// # GIVEN
/// An empty bus
///
/// # WHEN
/// The same identity is provisioned twice
///
/// # THEN
/// The first call creates the stream, the second finds it, and only one
/// creation reaches the bus
#[tokio::test]
async fn test_ensure_stream_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let bus = InMemoryBus::new();
    let registry = StreamRegistry::new(Arc::new(bus.clone()), RetentionSettings::default());
    let identity = StreamIdentity::agent("cynthia")?;

    assert_eq!(registry.ensure_stream(&identity).await?, StreamProvision::Created);
    assert_eq!(registry.ensure_stream(&identity).await?, StreamProvision::Existing);
    assert_eq!(bus.stream_creations().await, vec!["DELIVERABLES_CYNTHIA".to_string()]);

    let info = bus.stream_info("DELIVERABLES_CYNTHIA").await?;
    assert_eq!(info.map(|d| d.subject_pattern), Some("deliverables.cynthia.>".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_provisioning_creates_once() -> Result<(), Box<dyn std::error::Error>> {
    let bus = InMemoryBus::new();
    let registry = StreamRegistry::new(Arc::new(bus.clone()), RetentionSettings::default());
    let identity = StreamIdentity::agent("roy")?;

    let (a, b) = tokio::join!(registry.ensure_stream(&identity), registry.ensure_stream(&identity));
    let mut outcomes = vec![a?, b?];
    outcomes.sort_by_key(|p| *p == StreamProvision::Existing);
    assert_eq!(outcomes, vec![StreamProvision::Created, StreamProvision::Existing]);
    assert_eq!(bus.stream_creations().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_ensure_all_provisions_agents_and_orchestration() -> Result<(), Box<dyn std::error::Error>> {
    let bus = InMemoryBus::new();
    let registry = StreamRegistry::new(Arc::new(bus.clone()), RetentionSettings::default());

    let provisioned = registry.ensure_all(&identities_for(["cynthia", "sylvia"])?).await?;

    assert_eq!(provisioned.len(), 3);
    assert!(provisioned.iter().all(|(_, p)| *p == StreamProvision::Created));
    assert_eq!(
        bus.stream_creations().await,
        vec![
            "DELIVERABLES_CYNTHIA".to_string(),
            "DELIVERABLES_SYLVIA".to_string(),
            "ORCHESTRATION_EVENTS".to_string()
        ]
    );

    let again = registry.ensure_all(&identities_for(["cynthia", "sylvia"])?).await?;
    assert!(again.iter().all(|(_, p)| *p == StreamProvision::Existing));
    Ok(())
}
