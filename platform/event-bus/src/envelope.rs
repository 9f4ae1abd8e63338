//! # Event Envelope
//!
//! Wire format shared by the publisher and every consumer.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Unique identifier, the consumer-side idempotency key
//! - `event_type`: Domain fact tag (e.g. `Lead.New`), also sent as a message attribute
//! - `occurred_at`: When the originating action happened (set by the publisher)
//! - `tenant_id`: Workspace the event belongs to; handlers scope side effects by it
//! - `source_module`: Producer that emitted the event
//! - `correlation_id` / `causation_id`: Optional tracing links
//! - `payload`: Event-specific data, opaque to transports
//!
//! ## Accepted body shapes
//!
//! [`decode_body`] understands three shapes so that a queue can be fed from a
//! raw-delivery subscription, from a fan-out topic that wraps each message in a
//! notification document, or from older producers:
//!
//! 1. the envelope itself
//! 2. `{"Type":"Notification","Message":"<envelope json>", ...}`
//! 3. legacy `{"type":"Lead.New","data":{"id":..,"workspace_id":..,"created_at":..}}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Namespace for ids derived from legacy events that carry no `event_id`.
const LEGACY_EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x8f1c_2b7e_4d3a_4f06_9a51_c0de_1ead_5e7e);

/// Standard domain event envelope
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(
///     "Lead.New",
///     "workspace-123",
///     "crm-api",
///     json!({"id": "L1", "email": "a@x.com"}),
/// )
/// .with_correlation_id(Some("req-456".to_string()));
///
/// assert_eq!(envelope.event_type, "Lead.New");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key)
    pub event_id: Uuid,

    /// Domain fact tag, immutable once created
    pub event_type: String,

    /// Timestamp of the originating action
    pub occurred_at: DateTime<Utc>,

    /// Workspace identifier
    pub tenant_id: String,

    /// Module that generated the event (e.g. "crm-api")
    pub source_module: String,

    /// Links related events in a business transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Links this event to the command/event that caused it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Event-specific payload
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope with a fresh `event_id` and `occurred_at = now`
    pub fn new(
        event_type: impl Into<String>,
        tenant_id: impl Into<String>,
        source_module: impl Into<String>,
        payload: T,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            tenant_id: tenant_id.into(),
            source_module: source_module.into(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    /// Override the generated event id (useful for testing and replays)
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Set the correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation ID
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }
}

/// Reasons a queue message body cannot be turned into an envelope
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message body is empty")]
    EmptyBody,

    #[error("message body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("topic notification has no string Message field")]
    MalformedNotification,

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// Validate an undecoded envelope
///
/// # Validation Rules
///
/// - `event_id`: Must be a valid UUID
/// - `occurred_at`: Must be present
/// - `event_type`, `tenant_id`, `source_module`: Must be non-empty strings
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &Value) -> Result<(), String> {
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    Uuid::parse_str(event_id).map_err(|e| format!("event_id is not a UUID: {e}"))?;

    envelope
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    for field in ["event_type", "tenant_id", "source_module"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {field}"))?;

        if value.is_empty() {
            return Err(format!("{field} cannot be empty"));
        }
    }

    // correlation_id and causation_id are optional
    Ok(())
}

/// Decode a queue message body into an envelope with a JSON payload
pub fn decode_body(body: &[u8]) -> Result<EventEnvelope<Value>, DecodeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::EmptyBody);
    }

    let value: Value = serde_json::from_slice(body).map_err(DecodeError::InvalidJson)?;
    let value = unwrap_notification(value)?;

    if is_legacy_shape(&value) {
        return decode_legacy(value);
    }

    validate_envelope_fields(&value).map_err(DecodeError::InvalidEnvelope)?;
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidEnvelope(e.to_string()))
}

fn unwrap_notification(value: Value) -> Result<Value, DecodeError> {
    if value.get("Type").and_then(|v| v.as_str()) != Some("Notification") {
        return Ok(value);
    }

    let inner = value
        .get("Message")
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MalformedNotification)?;

    serde_json::from_str(inner).map_err(DecodeError::InvalidJson)
}

fn is_legacy_shape(value: &Value) -> bool {
    value.get("event_id").is_none() && value.get("type").is_some() && value.get("data").is_some()
}

#[derive(Deserialize)]
struct LegacyEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: Value,
}

fn decode_legacy(value: Value) -> Result<EventEnvelope<Value>, DecodeError> {
    let legacy: LegacyEvent =
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidEnvelope(e.to_string()))?;

    if legacy.event_type.is_empty() {
        return Err(DecodeError::InvalidEnvelope("type cannot be empty".to_string()));
    }

    let tenant_id = legacy
        .data
        .get("workspace_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DecodeError::InvalidEnvelope("legacy event has no data.workspace_id".to_string()))?
        .to_string();

    let entity_id = legacy
        .data
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DecodeError::InvalidEnvelope("legacy event has no data.id".to_string()))?;

    // Same entity + type always maps to the same id, so redeliveries dedupe.
    let event_id = Uuid::new_v5(
        &LEGACY_EVENT_NAMESPACE,
        format!("{}:{}", legacy.event_type, entity_id).as_bytes(),
    );

    let occurred_at = legacy
        .data
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(EventEnvelope {
        event_id,
        event_type: legacy.event_type,
        occurred_at,
        tenant_id,
        source_module: "legacy".to_string(),
        correlation_id: None,
        causation_id: None,
        payload: legacy.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_envelope() -> Value {
        json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "Lead.New",
            "occurred_at": "2024-01-01T00:00:00Z",
            "tenant_id": "workspace-123",
            "source_module": "crm-api",
            "payload": {"id": "L1", "email": "a@x.com"}
        })
    }

    #[test]
    fn test_envelope_creation() {
        let envelope = EventEnvelope::new("Lead.New", "workspace-123", "crm-api", json!({"id": "L1"}));

        assert_eq!(envelope.event_type, "Lead.New");
        assert_eq!(envelope.tenant_id, "workspace-123");
        assert_eq!(envelope.source_module, "crm-api");
        assert!(envelope.correlation_id.is_none());
        assert!(envelope.causation_id.is_none());
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let ids: std::collections::HashSet<Uuid> = (0..1000)
            .map(|_| EventEnvelope::new("Lead.New", "w", "crm-api", ()).event_id)
            .collect();

        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_optional_links_are_omitted_on_the_wire() {
        let envelope = EventEnvelope::new("Lead.New", "w", "crm-api", json!({}));
        let wire = serde_json::to_value(&envelope).unwrap();

        assert!(wire.get("correlation_id").is_none());
        assert!(wire.get("causation_id").is_none());
    }

    #[test]
    fn test_validate_envelope_fields_valid() {
        assert!(validate_envelope_fields(&valid_envelope()).is_ok());
    }

    #[test]
    fn test_validate_envelope_fields_empty_tenant_id() {
        let mut envelope = valid_envelope();
        envelope["tenant_id"] = json!("");

        let err = validate_envelope_fields(&envelope).unwrap_err();
        assert!(err.contains("tenant_id"));
    }

    #[test]
    fn test_validate_envelope_fields_bad_event_id() {
        let mut envelope = valid_envelope();
        envelope["event_id"] = json!("not-a-uuid");

        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_decode_raw_envelope() {
        let body = serde_json::to_vec(&valid_envelope()).unwrap();
        let envelope = decode_body(&body).unwrap();

        assert_eq!(envelope.event_type, "Lead.New");
        assert_eq!(envelope.payload["email"], "a@x.com");
    }

    #[test]
    fn test_decode_unwraps_topic_notification() {
        let inner = serde_json::to_string(&valid_envelope()).unwrap();
        let body = serde_json::to_vec(&json!({
            "Type": "Notification",
            "MessageId": "m-1",
            "TopicArn": "crm-events",
            "Message": inner,
            "Timestamp": "2024-01-01T00:00:01Z"
        }))
        .unwrap();

        let envelope = decode_body(&body).unwrap();
        assert_eq!(
            envelope.event_id,
            Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
        );
    }

    #[test]
    fn test_decode_notification_without_message_fails() {
        let body = serde_json::to_vec(&json!({"Type": "Notification", "Message": 42})).unwrap();

        assert!(matches!(
            decode_body(&body),
            Err(DecodeError::MalformedNotification)
        ));
    }

    #[test]
    fn test_decode_legacy_shape_has_stable_id() {
        let body = serde_json::to_vec(&json!({
            "type": "Lead.New",
            "data": {
                "id": "L1",
                "email": "a@x.com",
                "status": "new",
                "created_at": "2024-03-01T10:00:00.000Z",
                "workspace_id": "test-workspace"
            }
        }))
        .unwrap();

        let first = decode_body(&body).unwrap();
        let second = decode_body(&body).unwrap();

        assert_eq!(first.event_id, second.event_id);
        assert_eq!(first.tenant_id, "test-workspace");
        assert_eq!(first.source_module, "legacy");
        assert_eq!(first.occurred_at.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_body(b""), Err(DecodeError::EmptyBody)));
        assert!(matches!(decode_body(b"{oops"), Err(DecodeError::InvalidJson(_))));
        assert!(matches!(
            decode_body(br#"{"event_type":"Lead.New"}"#),
            Err(DecodeError::InvalidEnvelope(_))
        ));
    }
}
