//! Graceful shutdown handling.
//!
//! Handles SIGTERM/SIGINT, stops intake, drains in-flight stage tasks within
//! the configured window, then releases the bus and the knowledge store in
//! that order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use conduit_bus::MessageBus;

use crate::persistence::KnowledgeStore;

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    /// SIGTERM signal received
    Sigterm,
    /// SIGINT signal received (Ctrl+C)
    Sigint,
    /// Programmatic shutdown requested
    Programmatic,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

/// Shutdown coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// Intake stopped, waiting for in-flight work
    Draining,
    /// Closing the bus and the store
    ReleasingResources,
    /// Done
    Stopped,
}

/// How the drain went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every in-flight task finished inside the drain window.
    pub drained: bool,
    /// Tasks still running when the window closed.
    pub remaining: usize,
    pub elapsed: Duration,
}

/// Shutdown coordinator for graceful process shutdown
pub struct ShutdownCoordinator {
    phase: RwLock<ShutdownPhase>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the given drain window.
    #[must_use]
    pub fn new(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            phase: RwLock::new(ShutdownPhase::Running),
            running: AtomicBool::new(true),
            shutdown_tx,
            drain_timeout,
        }
    }

    /// Get the current shutdown phase
    pub async fn phase(&self) -> ShutdownPhase {
        *self.phase.read().await
    }

    /// False once shutdown has been requested.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Resolve once shutdown has been requested, immediately if it already was.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        if !self.is_running() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Request shutdown. Returns false if shutdown was already requested.
    pub async fn initiate_shutdown(&self, signal: ShutdownSignal) -> bool {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(signal = %signal, "Shutdown already in progress, ignoring duplicate signal");
            return false;
        }

        info!(signal = %signal, "Initiating graceful shutdown");
        *self.phase.write().await = ShutdownPhase::Draining;

        info!(
            subscribers = self.shutdown_tx.receiver_count(),
            "Broadcasting shutdown signal to subscribers"
        );
        if let Err(e) = self.shutdown_tx.send(signal) {
            debug!("No active subscribers for shutdown signal: {}", e);
        }
        true
    }

    /// Drain `tracker` within the window, then release the bus and the store.
    pub async fn shutdown(
        &self,
        tracker: &TaskTracker,
        bus: &dyn MessageBus,
        store: &dyn KnowledgeStore,
    ) -> ShutdownReport {
        self.initiate_shutdown(ShutdownSignal::Programmatic).await;
        let start = Instant::now();

        tracker.close();
        info!(
            in_flight = tracker.len(),
            timeout_secs = self.drain_timeout.as_secs(),
            "Draining in-flight work"
        );

        let drained = timeout(self.drain_timeout, tracker.wait()).await.is_ok();
        let remaining = if drained { 0 } else { tracker.len() };
        if !drained {
            warn!(
                remaining,
                timeout_secs = self.drain_timeout.as_secs(),
                "Drain window exceeded, forcing shutdown"
            );
        }

        *self.phase.write().await = ShutdownPhase::ReleasingResources;
        if let Err(e) = bus.close().await {
            error!(error = %e, "Failed to release bus connection");
        }
        if let Err(e) = store.close().await {
            error!(error = %e, "Failed to release knowledge store");
        }

        *self.phase.write().await = ShutdownPhase::Stopped;
        let report = ShutdownReport {
            drained,
            remaining,
            elapsed: start.elapsed(),
        };
        info!(
            drained = report.drained,
            remaining = report.remaining,
            duration_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Shutdown complete"
        );
        report
    }
}

/// Install OS signal handlers (SIGTERM, SIGINT)
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) -> tokio::task::JoinHandle<()> {
    info!("Installing OS signal handlers");

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGINT handler");
                    return;
                }
            };

            loop {
                let signal = tokio::select! {
                    _ = sigterm.recv() => ShutdownSignal::Sigterm,
                    _ = sigint.recv() => ShutdownSignal::Sigint,
                };
                info!(signal = %signal, "Received signal");
                coordinator.initiate_shutdown(signal).await;
            }
        }

        #[cfg(not(unix))]
        {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                info!("Received Ctrl+C");
                coordinator.initiate_shutdown(ShutdownSignal::Sigint).await;
            }
        }
    })
}
