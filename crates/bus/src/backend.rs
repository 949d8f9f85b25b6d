//! Message bus abstraction.
//!
//! `MessageBus` is the seam between Conduit and the broker. Production runs on
//! NATS JetStream; tests run on the in-memory implementation.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use conduit_core::{BusSettings, DeliverableLocator, StreamDescriptor};

use crate::error::BusResult;

/// Where a published message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub stream: String,
    pub sequence: u64,
}

impl From<PublishReceipt> for DeliverableLocator {
    fn from(receipt: PublishReceipt) -> Self {
        Self::new(receipt.stream, receipt.sequence)
    }
}

/// A message read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub subject: String,
    pub sequence: u64,
    pub payload: Bytes,
}

/// Durable, explicit-ack, deliver-all consumer definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub durable_name: String,
    pub filter_subject: String,
    /// Maximum delivery attempts per message; `<= 0` means unlimited.
    pub max_deliver: i64,
    /// Redelivery deadline for a delivery that has seen no ack or progress.
    pub ack_wait: Duration,
    /// Unacked deliveries outstanding at once; `<= 0` means unlimited.
    pub max_ack_pending: i64,
}

impl ConsumerSpec {
    /// Build a consumer spec for `stream` from bus settings.
    pub fn from_settings(stream: impl Into<String>, settings: &BusSettings) -> Self {
        Self {
            stream: stream.into(),
            durable_name: settings.durable_name.clone(),
            filter_subject: settings.filter_subject.clone(),
            max_deliver: settings.max_deliver,
            ack_wait: settings.ack_wait,
            max_ack_pending: 0,
        }
    }

    #[must_use]
    pub fn with_max_ack_pending(mut self, max_ack_pending: i64) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }

    /// How often a held delivery should report progress, or `None` when
    /// the consumer has no ack deadline.
    #[must_use]
    pub fn progress_interval(&self) -> Option<Duration> {
        if self.ack_wait.is_zero() {
            return None;
        }
        self.ack_wait.checked_div(3)
    }
}

/// Resolution of one delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Tell the bus the message is still being worked on, restarting its
    /// ack deadline. May be sent any number of times before `ack`/`nak`.
    async fn in_progress(&self) -> BusResult<()>;

    /// Confirm the message was handled.
    async fn ack(self: Box<Self>) -> BusResult<()>;

    /// Reject the message so the bus may redeliver it.
    async fn nak(self: Box<Self>) -> BusResult<()>;
}

/// One delivered message.
///
/// `ack` and `nak` consume the delivery, so a delivery resolves at most once.
/// `in_progress` borrows it and only pushes the redelivery deadline out.
pub struct Delivery {
    pub subject: String,
    pub sequence: u64,
    /// 1-based delivery attempt.
    pub attempt: u64,
    pub payload: Bytes,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Create a delivery backed by `acker`.
    pub fn new(
        subject: impl Into<String>,
        sequence: u64,
        attempt: u64,
        payload: Bytes,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            subject: subject.into(),
            sequence,
            attempt,
            payload,
            acker,
        }
    }

    /// Extend the ack deadline without resolving the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the progress signal could not be delivered.
    pub async fn in_progress(&self) -> BusResult<()> {
        self.acker.in_progress().await
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the ack could not be delivered to the bus.
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the nak could not be delivered to the bus.
    pub async fn nak(self) -> BusResult<()> {
        self.acker.nak().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("attempt", &self.attempt)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a durable consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = BusResult<Delivery>> + Send>>;

/// Operations Conduit needs from the broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Look up a stream's current configuration.
    async fn stream_info(&self, name: &str) -> BusResult<Option<StreamDescriptor>>;

    /// Create a stream. Fails with `StreamExists` if the name is taken.
    async fn create_stream(&self, descriptor: &StreamDescriptor) -> BusResult<()>;

    /// Append a message to whichever stream captures `subject`.
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<PublishReceipt>;

    /// Last message stored on exactly `subject` in `stream`.
    async fn last_message(&self, stream: &str, subject: &str) -> BusResult<Option<StoredMessage>>;

    /// Bind (or resume) a durable consumer and stream its deliveries.
    async fn subscribe(&self, spec: &ConsumerSpec) -> BusResult<DeliveryStream>;

    /// Flush and release the connection.
    async fn close(&self) -> BusResult<()>;
}
