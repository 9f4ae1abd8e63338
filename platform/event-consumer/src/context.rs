//! Per-delivery metadata handed to every handler invocation.

use chrono::{DateTime, Utc};
use event_bus::{EventEnvelope, QueueMessage};
use serde_json::Value;
use uuid::Uuid;

/// Who, what and which attempt: everything a handler needs besides the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    /// Idempotency key
    pub event_id: Uuid,
    pub event_type: String,
    /// Workspace the side effects must be scoped to
    pub tenant_id: String,
    pub source_module: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    /// Queue delivery count, starting at 1
    pub delivery_attempt: u32,
    /// Transport message id, stable across redeliveries
    pub message_id: String,
}

impl EventContext {
    pub fn from_delivery(envelope: &EventEnvelope<Value>, message: &QueueMessage) -> Self {
        Self {
            event_id: envelope.event_id,
            event_type: envelope.event_type.clone(),
            tenant_id: envelope.tenant_id.clone(),
            source_module: envelope.source_module.clone(),
            occurred_at: envelope.occurred_at,
            correlation_id: envelope.correlation_id.clone(),
            delivery_attempt: message.delivery_count,
            message_id: message.message_id.clone(),
        }
    }
}
