//! Publish and fetch deliverables keyed by (agent, task type, request).

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use conduit_core::{Deliverable, DeliverableLocator, DeliverableMetadata};

use crate::backend::MessageBus;
use crate::error::{BusError, BusResult};
use crate::registry::agent_stream_name;
use crate::subject::{deliverable_subject, validate_token};

/// Deliverable store on top of per-agent streams.
///
/// Publishing twice under the same key keeps both messages; `fetch_latest`
/// returns the newer one.
#[derive(Clone)]
pub struct DeliverableExchange {
    bus: Arc<dyn MessageBus>,
    max_message_size: usize,
}

impl DeliverableExchange {
    pub fn new(bus: Arc<dyn MessageBus>, max_message_size: usize) -> Self {
        Self {
            bus,
            max_message_size,
        }
    }

    /// Publish a deliverable and return where it landed.
    ///
    /// # Errors
    ///
    /// - `InvalidSubjectToken` if a key part is not a valid subject token
    /// - `PayloadTooLarge` if the encoded envelope exceeds the ceiling
    /// - `PublishFailed` / `NoStreamForSubject` from the bus
    pub async fn publish(
        &self,
        agent_id: &str,
        task_type: &str,
        request_id: &str,
        payload: Value,
        metadata: DeliverableMetadata,
    ) -> BusResult<DeliverableLocator> {
        let subject = deliverable_subject(agent_id, task_type, request_id)?;
        let envelope = Deliverable {
            agent_id: agent_id.to_string(),
            task_type: task_type.to_string(),
            request_id: request_id.to_string(),
            payload,
            metadata,
        };
        let encoded = serde_json::to_vec(&envelope)?;
        if encoded.len() > self.max_message_size {
            return Err(BusError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_message_size,
            });
        }

        let receipt = self.bus.publish(&subject, Bytes::from(encoded)).await?;
        debug!(subject = %subject, stream = %receipt.stream, sequence = receipt.sequence, "Published deliverable");
        Ok(receipt.into())
    }

    /// Most recent deliverable under the key, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid, the bus read fails, or the
    /// stored envelope cannot be decoded.
    pub async fn fetch_latest(
        &self,
        agent_id: &str,
        task_type: &str,
        request_id: &str,
    ) -> BusResult<Option<Deliverable>> {
        let subject = deliverable_subject(agent_id, task_type, request_id)?;
        let stream = agent_stream_name(validate_token(agent_id)?);

        let message = match self.bus.last_message(&stream, &subject).await {
            Ok(message) => message,
            Err(BusError::StreamNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        message
            .map(|m| serde_json::from_slice::<Deliverable>(&m.payload).map_err(BusError::from))
            .transpose()
    }
}
