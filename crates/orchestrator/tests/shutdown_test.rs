//! Integration tests for graceful shutdown of a running conductor.

#![forbid(clippy::unwrap_used)]
#![forbid(clippy::expect_used)]

mod support;

use std::time::Duration;

use conduit_core::{AckMode, StageEvent};
use conduit_orchestrator::{ShutdownPhase, ShutdownSignal};

use support::{config, eventually, Harness, Script, TestResult};

/// # GIVEN
/// A 30s drain window and an in-flight worker that exits after 5s
///
/// # WHEN
/// Shutdown is requested right after admission
///
/// # THEN
/// Shutdown completes once the worker finished, in about 5s, and its
/// deliverable is published before the bus is released
#[tokio::test(start_paused = true)]
async fn test_drain_waits_for_in_flight_worker() -> TestResult {
    let script = Script::completes().taking(Duration::from_secs(5));
    let harness = Harness::start(config(2, AckMode::OnAdmission, Duration::from_secs(30)), script).await?;
    let dispatcher = harness.conductor.dispatcher();

    harness.publish(&StageEvent::started("REQ-1", "Research", "cynthia")).await?;

    let coordinator = harness.conductor.shutdown_coordinator();
    let trigger = {
        let coordinator = coordinator.clone();
        let runner = harness.runner.clone();
        tokio::spawn(async move {
            let started = eventually(|| {
                let runner = runner.clone();
                async move { runner.active() == 1 }
            })
            .await;
            coordinator.initiate_shutdown(ShutdownSignal::Sigterm).await;
            started
        })
    };

    let report = harness.conductor.run_until_shutdown(&dispatcher).await?;
    assert!(trigger.await?);

    assert!(report.drained);
    assert_eq!(report.remaining, 0);
    assert!(report.elapsed <= Duration::from_secs(5));
    assert!(report.elapsed >= Duration::from_secs(4));
    assert_eq!(coordinator.phase().await, ShutdownPhase::Stopped);

    assert!(!harness.store.deliverables_for_request("REQ-1").await.unwrap_or_default().is_empty());
    assert!(harness.bus.is_closed().await);
    assert!(harness.store.is_closed());
    Ok(())
}

/// # GIVEN
/// A 30s drain window and a worker that never finishes in time
///
/// # WHEN
/// Shutdown is requested
///
/// # THEN
/// Shutdown is forced at 30s and reports the task left behind
#[tokio::test(start_paused = true)]
async fn test_drain_window_forces_shutdown() -> TestResult {
    let script = Script::completes().taking(Duration::from_secs(3600));
    let harness = Harness::start(config(2, AckMode::OnAdmission, Duration::from_secs(30)), script).await?;
    let dispatcher = harness.spawn_dispatcher();

    harness.publish(&StageEvent::started("REQ-2", "QA", "billy")).await?;
    let runner = harness.runner.clone();
    assert!(eventually(|| {
        let runner = runner.clone();
        async move { runner.active() == 1 }
    })
    .await);

    let report = harness
        .conductor
        .shutdown_coordinator()
        .shutdown(harness.conductor.tracker(), &harness.bus, harness.store.as_ref())
        .await;

    assert!(!report.drained);
    assert_eq!(report.remaining, 1);
    assert!(report.elapsed >= Duration::from_secs(30));
    assert!(report.elapsed < Duration::from_secs(31));
    assert_eq!(dispatcher.stats().admitted, 1);
    assert!(harness.bus.is_closed().await);
    Ok(())
}

/// # GIVEN
/// An idle conductor
///
/// # WHEN
/// Shutdown is requested twice
///
/// # THEN
/// Only the first request counts and the run ends cleanly
#[tokio::test(start_paused = true)]
async fn test_idle_conductor_stops_on_signal() -> TestResult {
    let harness = Harness::start(config(1, AckMode::OnAdmission, Duration::from_secs(30)), Script::completes()).await?;
    let dispatcher = harness.conductor.dispatcher();
    let coordinator = harness.conductor.shutdown_coordinator();

    let trigger = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let first = coordinator.initiate_shutdown(ShutdownSignal::Sigint).await;
            let second = coordinator.initiate_shutdown(ShutdownSignal::Sigterm).await;
            (first, second)
        })
    };

    let report = harness.conductor.run_until_shutdown(&dispatcher).await?;
    assert_eq!(trigger.await?, (true, false));
    assert!(report.drained);
    assert_eq!(dispatcher.stats().received, 0);
    assert!(harness.store.is_closed());
    Ok(())
}
