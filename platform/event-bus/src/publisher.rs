//! Publisher: turns a domain fact into an envelope and hands it to the topic.
//!
//! Exactly one transport call per publish. Nothing is retried here; see
//! [`crate::retry`] for the caller-side helper. A caller that retries must
//! resend the same envelope (build it with [`EventPublisher::build_envelope`]
//! and retry [`EventPublisher::publish_envelope`]): a failed ack does not mean
//! the topic dropped the message, and consumers deduplicate on `event_id`.

use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::{BusError, EventEnvelope, Topic, TopicMessage, EVENT_TYPE_ATTRIBUTE};

/// Largest serialized envelope the topic accepts (256 KiB)
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialized event is {size} bytes, limit is {limit}")]
    Oversize { size: usize, limit: usize },

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    PublishFailed(#[from] BusError),
}

impl PublishError {
    /// Only transport failures can succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::PublishFailed(_))
    }
}

/// Publishes domain events for one producing module
#[derive(Clone)]
pub struct EventPublisher {
    topic: Arc<dyn Topic>,
    source_module: String,
}

impl EventPublisher {
    pub fn new(topic: Arc<dyn Topic>, source_module: impl Into<String>) -> Self {
        Self {
            topic,
            source_module: source_module.into(),
        }
    }

    pub fn source_module(&self) -> &str {
        &self.source_module
    }

    /// Publish `payload` as a new `event_type` event for `tenant_id`.
    ///
    /// Returns the generated `event_id`.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: Value,
        tenant_id: &str,
    ) -> Result<Uuid, PublishError> {
        let envelope = self.build_envelope(event_type, payload, tenant_id);
        self.publish_envelope(&envelope).await?;
        Ok(envelope.event_id)
    }

    /// A fresh envelope stamped with this publisher's `source_module`
    pub fn build_envelope(
        &self,
        event_type: &str,
        payload: Value,
        tenant_id: &str,
    ) -> EventEnvelope<Value> {
        EventEnvelope::new(event_type, tenant_id, self.source_module.as_str(), payload)
    }

    /// Publish an envelope the caller built (e.g. to set correlation ids)
    pub async fn publish_envelope(&self, envelope: &EventEnvelope<Value>) -> Result<(), PublishError> {
        if envelope.event_type.is_empty() {
            return Err(PublishError::InvalidEvent("event_type cannot be empty".to_string()));
        }
        if envelope.tenant_id.is_empty() {
            return Err(PublishError::InvalidEvent("tenant_id cannot be empty".to_string()));
        }

        let body = serde_json::to_vec(envelope)?;
        if body.len() > MAX_MESSAGE_BYTES {
            return Err(PublishError::Oversize {
                size: body.len(),
                limit: MAX_MESSAGE_BYTES,
            });
        }

        let message =
            TopicMessage::new(body).with_attribute(EVENT_TYPE_ATTRIBUTE, envelope.event_type.as_str());

        if let Err(e) = self.topic.publish(message).await {
            tracing::error!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                tenant_id = %envelope.tenant_id,
                error = %e,
                "Failed to publish event"
            );
            return Err(e.into());
        }

        tracing::debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            tenant_id = %envelope.tenant_id,
            "Event published"
        );

        Ok(())
    }
}
