//! Concurrency-bounded dispatch of stage events.
//!
//! The consume loop reads `stage.started` events from a durable consumer,
//! waits for a [`DispatchSlot`], and hands each admitted event to the
//! [`StageProcessor`] on a tracked task. Every delivery is settled by
//! exactly one ack or nak. While a delivery is held unsettled (waiting for a
//! slot, or running under [`AckMode::OnCompletion`]) it reports progress so
//! the bus does not redeliver it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use conduit_bus::{ConsumerSpec, Delivery, MessageBus};
use conduit_core::{AckMode, StageEvent};

use crate::error::OrchestratorResult;
use crate::pipeline::StageProcessor;
use crate::shutdown::ShutdownCoordinator;

const STREAM_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Admission control for worker processes.
#[derive(Debug, Clone)]
pub struct DispatchSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the lifetime of one worker; released on drop.
#[derive(Debug)]
pub struct DispatchSlot {
    _permit: OwnedSemaphorePermit,
}

impl DispatchSlots {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot. `None` only if the slots were closed.
    pub async fn acquire(&self) -> Option<DispatchSlot> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| DispatchSlot { _permit: permit })
    }

    /// Slots currently held.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    admitted: AtomicU64,
    malformed: AtomicU64,
    skipped: AtomicU64,
    nacked: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Dispatcher counters. `nacked` includes malformed events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub admitted: u64,
    pub malformed: u64,
    pub skipped: u64,
    pub nacked: u64,
}

/// Consumes stage events and runs them under a concurrency bound.
#[derive(Clone)]
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    processor: StageProcessor,
    slots: DispatchSlots,
    ack_mode: AckMode,
    consumer: ConsumerSpec,
    tracker: TaskTracker,
    shutdown: Arc<ShutdownCoordinator>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        processor: StageProcessor,
        slots: DispatchSlots,
        ack_mode: AckMode,
        consumer: ConsumerSpec,
        tracker: TaskTracker,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            bus,
            processor,
            slots,
            ack_mode,
            consumer,
            tracker,
            shutdown,
            counters: Arc::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            received: c.received.load(Ordering::Relaxed),
            admitted: c.admitted.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            nacked: c.nacked.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn outstanding_slots(&self) -> usize {
        self.slots.outstanding()
    }

    /// Consume until shutdown is requested or the delivery stream ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable consumer cannot be bound.
    pub async fn run(&self) -> OrchestratorResult<()> {
        let mut deliveries = self.bus.subscribe(&self.consumer).await?;
        info!(
            stream = %self.consumer.stream,
            durable = %self.consumer.durable_name,
            max_concurrent = self.slots.capacity(),
            ack_mode = ?self.ack_mode,
            "Dispatcher running"
        );

        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.wait_for_shutdown() => break,
                next = deliveries.next() => next,
            };
            match next {
                Some(Ok(delivery)) => self.handle(delivery).await,
                Some(Err(e)) => {
                    warn!(error = %e, retryable = e.is_retryable(), "Delivery stream error");
                    tokio::time::sleep(STREAM_ERROR_BACKOFF).await;
                }
                None => {
                    info!("Delivery stream ended");
                    break;
                }
            }
        }

        info!(stats = ?self.stats(), "Dispatcher stopped taking events");
        Ok(())
    }

    async fn handle(&self, delivery: Delivery) {
        Counters::bump(&self.counters.received);
        let sequence = delivery.sequence;

        let event = match StageEvent::decode(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                Counters::bump(&self.counters.malformed);
                warn!(subject = %delivery.subject, sequence, error = %e, "Malformed stage event");
                self.nak(delivery).await;
                return;
            }
        };

        if !event.is_stage_started() {
            Counters::bump(&self.counters.skipped);
            debug!(sequence, event_type = %event.event_type, "Skipping non-dispatch event");
            settle_ack(delivery).await;
            return;
        }

        let progress = self.consumer.progress_interval();
        let slot = tokio::select! {
            biased;
            () = self.shutdown.wait_for_shutdown() => None,
            slot = keep_alive(&delivery, progress, self.slots.acquire()) => slot,
        };
        let Some(slot) = slot else {
            info!(request_id = %event.request_id, sequence, "Shutdown while waiting for a slot; returning event");
            self.nak(delivery).await;
            return;
        };

        Counters::bump(&self.counters.admitted);
        debug!(
            request_id = %event.request_id,
            agent_id = %event.agent_id,
            outstanding = self.slots.outstanding(),
            "Event admitted"
        );

        let processor = self.processor.clone();
        match self.ack_mode {
            AckMode::OnAdmission => {
                settle_ack(delivery).await;
                self.tracker.spawn(async move {
                    let resolution = processor.process(&event).await;
                    drop(slot);
                    info!(request_id = %event.request_id, resolution = ?resolution, "Stage resolved");
                });
            }
            AckMode::OnCompletion => {
                self.tracker.spawn(async move {
                    let resolution = keep_alive(&delivery, progress, processor.process(&event)).await;
                    drop(slot);
                    info!(request_id = %event.request_id, resolution = ?resolution, "Stage resolved");
                    settle_ack(delivery).await;
                });
            }
        }
    }

    async fn nak(&self, delivery: Delivery) {
        Counters::bump(&self.counters.nacked);
        let sequence = delivery.sequence;
        if let Err(e) = delivery.nak().await {
            warn!(sequence, error = %e, "Failed to nak delivery");
        }
    }
}

/// Drive `work` to completion, telling the bus every `interval` that
/// `delivery` is still being handled.
async fn keep_alive<F: Future>(delivery: &Delivery, interval: Option<Duration>, work: F) -> F::Output {
    let Some(interval) = interval.filter(|i| !i.is_zero()) else {
        return work.await;
    };
    tokio::pin!(work);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            output = &mut work => return output,
            _ = ticker.tick() => {
                if let Err(e) = delivery.in_progress().await {
                    debug!(sequence = delivery.sequence, error = %e, "Progress signal failed");
                }
            }
        }
    }
}

async fn settle_ack(delivery: Delivery) {
    let sequence = delivery.sequence;
    if let Err(e) = delivery.ack().await {
        warn!(sequence, error = %e, "Failed to ack delivery");
    }
}
