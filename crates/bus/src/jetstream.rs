//! NATS JetStream backend.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    context::{CreateStreamErrorKind, GetStreamErrorKind},
    stream::{self, LastRawMessageErrorKind, StorageType},
    AckKind, ErrorCode,
};
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

use conduit_core::{BusCredentials, BusSettings, DiscardPolicy, StreamDescriptor};

use crate::backend::{
    Acknowledge, ConsumerSpec, Delivery, DeliveryStream, MessageBus, PublishReceipt, StoredMessage,
};
use crate::error::{BusError, BusResult};

const CLIENT_NAME: &str = "conduit";

/// Message bus backed by a NATS JetStream server.
#[derive(Clone)]
pub struct JetStreamBus {
    client: Client,
    context: jetstream::Context,
}

impl JetStreamBus {
    /// Connect using the configured URL and credentials.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the server cannot be reached or rejects
    /// the credentials.
    pub async fn connect(settings: &BusSettings) -> BusResult<Self> {
        let options = match &settings.credentials {
            Some(BusCredentials::UserPassword { user, password }) => {
                ConnectOptions::with_user_and_password(user.clone(), password.clone())
            }
            Some(BusCredentials::Token { token }) => ConnectOptions::with_token(token.clone()),
            None => ConnectOptions::new(),
        };

        let client = options
            .name(CLIENT_NAME)
            .connect(settings.url.as_str())
            .await
            .map_err(|e| BusError::connection_failed(format!("{}: {e}", settings.url)))?;

        info!(url = %settings.url, "Connected to NATS");
        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self { client, context }
    }

    async fn get_stream(&self, name: &str) -> BusResult<Option<jetstream::stream::Stream>> {
        match self.context.get_stream(name).await {
            Ok(stream) => Ok(Some(stream)),
            Err(err) => match err.kind() {
                GetStreamErrorKind::JetStream(js) if js.error_code() == ErrorCode::STREAM_NOT_FOUND => {
                    Ok(None)
                }
                _ => Err(BusError::stream_provisioning(name, err.to_string())),
            },
        }
    }
}

fn to_descriptor(config: &stream::Config) -> StreamDescriptor {
    StreamDescriptor {
        name: config.name.clone(),
        subject_pattern: config.subjects.first().cloned().unwrap_or_default(),
        max_messages: u64::try_from(config.max_messages).unwrap_or(0),
        max_bytes: u64::try_from(config.max_bytes).unwrap_or(0),
        max_age: config.max_age,
        max_message_size: u32::try_from(config.max_message_size).unwrap_or(0),
        discard_policy: match config.discard {
            stream::DiscardPolicy::New => DiscardPolicy::New,
            _ => DiscardPolicy::Old,
        },
    }
}

fn to_config(descriptor: &StreamDescriptor) -> stream::Config {
    stream::Config {
        name: descriptor.name.clone(),
        subjects: vec![descriptor.subject_pattern.clone()],
        max_messages: i64::try_from(descriptor.max_messages).unwrap_or(i64::MAX),
        max_bytes: i64::try_from(descriptor.max_bytes).unwrap_or(i64::MAX),
        max_age: descriptor.max_age,
        max_message_size: i32::try_from(descriptor.max_message_size).unwrap_or(i32::MAX),
        discard: match descriptor.discard_policy {
            DiscardPolicy::Old => stream::DiscardPolicy::Old,
            DiscardPolicy::New => stream::DiscardPolicy::New,
        },
        storage: StorageType::File,
        ..Default::default()
    }
}

fn consumer_config(spec: &ConsumerSpec) -> pull::Config {
    pull::Config {
        durable_name: Some(spec.durable_name.clone()),
        filter_subject: spec.filter_subject.clone(),
        ack_policy: AckPolicy::Explicit,
        deliver_policy: DeliverPolicy::All,
        max_deliver: spec.max_deliver,
        ack_wait: spec.ack_wait,
        max_ack_pending: spec.max_ack_pending,
        ..Default::default()
    }
}

#[async_trait]
impl MessageBus for JetStreamBus {
    async fn stream_info(&self, name: &str) -> BusResult<Option<StreamDescriptor>> {
        Ok(self
            .get_stream(name)
            .await?
            .map(|stream| to_descriptor(&stream.cached_info().config)))
    }

    async fn create_stream(&self, descriptor: &StreamDescriptor) -> BusResult<()> {
        match self.context.create_stream(to_config(descriptor)).await {
            Ok(_) => {
                debug!(stream = %descriptor.name, "Created JetStream stream");
                Ok(())
            }
            Err(err) => match err.kind() {
                CreateStreamErrorKind::JetStream(js)
                    if js.error_code() == ErrorCode::STREAM_NAME_EXIST =>
                {
                    Err(BusError::StreamExists {
                        stream: descriptor.name.clone(),
                    })
                }
                _ => Err(BusError::stream_provisioning(&descriptor.name, err.to_string())),
            },
        }
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<PublishReceipt> {
        let ack = self
            .context
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::publish_failed(subject, e.to_string()))?
            .await
            .map_err(|e| BusError::publish_failed(subject, e.to_string()))?;

        Ok(PublishReceipt {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }

    async fn last_message(&self, stream: &str, subject: &str) -> BusResult<Option<StoredMessage>> {
        let Some(handle) = self.get_stream(stream).await? else {
            return Err(BusError::stream_not_found(stream));
        };

        match handle.get_last_raw_message_by_subject(subject).await {
            Ok(message) => Ok(Some(StoredMessage {
                subject: message.subject.to_string(),
                sequence: message.sequence,
                payload: message.payload,
            })),
            Err(err) if matches!(err.kind(), LastRawMessageErrorKind::NoMessageFound) => Ok(None),
            Err(err) => Err(BusError::fetch_failed(subject, err.to_string())),
        }
    }

    async fn subscribe(&self, spec: &ConsumerSpec) -> BusResult<DeliveryStream> {
        let Some(stream) = self.get_stream(&spec.stream).await? else {
            return Err(BusError::stream_not_found(&spec.stream));
        };

        let consumer = stream
            .get_or_create_consumer(&spec.durable_name, consumer_config(spec))
            .await
            .map_err(|e| BusError::subscription_failed(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::subscription_failed(e.to_string()))?;

        info!(
            stream = %spec.stream,
            durable = %spec.durable_name,
            filter = %spec.filter_subject,
            max_ack_pending = spec.max_ack_pending,
            "Bound durable consumer"
        );

        let deliveries = messages.map(|result| -> BusResult<Delivery> {
            let message = result.map_err(|e| BusError::subscription_failed(e.to_string()))?;
            let (sequence, attempt) = match message.info() {
                Ok(info) => (info.stream_sequence, u64::try_from(info.delivered).unwrap_or(1)),
                Err(e) => {
                    warn!(error = %e, "Delivery carried no JetStream metadata");
                    (0, 1)
                }
            };
            let subject = message.subject.to_string();
            let payload = message.payload.clone();
            Ok(Delivery::new(
                subject,
                sequence,
                attempt,
                payload,
                Box::new(JetStreamAcker { message }),
            ))
        });

        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::connection_failed(format!("flush on close: {e}")))?;
        info!("Released NATS connection");
        Ok(())
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledge for JetStreamAcker {
    async fn in_progress(&self) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| BusError::ack_failed(e.to_string()))
    }

    async fn ack(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::ack_failed(e.to_string()))
    }

    async fn nak(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::ack_failed(e.to_string()))
    }
}
