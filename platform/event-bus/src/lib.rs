//! # Event Bus
//!
//! Transport layer of the domain-event pipeline: a producer publishes an
//! [`EventEnvelope`] to a fan-out [`Topic`], every subscription receives its
//! own copy in a durable [`Queue`], and a consumer long-polls that queue.
//!
//! ## Delivery model
//!
//! Queues are **at-least-once**. A received message stays hidden from other
//! consumers until its visibility deadline; if it is not deleted by then it is
//! delivered again with `delivery_count + 1`. Once a message has been
//! delivered `max_receive_count` times without being deleted, the transport
//! moves it to a dead-letter location (see [`RedrivePolicy`]). Consumers never
//! route dead letters themselves.
//!
//! ## Implementations
//!
//! - **InMemoryBroker**: topic + subscription queues in process memory, used
//!   by tests and local development
//! - **JetStreamTopic / JetStreamQueue**: production transport on NATS
//!   JetStream (durable pull consumer, explicit ack)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventPublisher, InMemoryBroker, Queue, ReceiveRequest, SubscriptionConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let queue = broker.subscribe(SubscriptionConfig::new("lead-worker").with_event_types(["Lead.New"]));
//!
//! let publisher = EventPublisher::new(Arc::new(broker.clone()), "crm-api");
//! let event_id = publisher
//!     .publish("Lead.New", serde_json::json!({"id": "L1"}), "workspace-1")
//!     .await?;
//!
//! let messages = queue.receive(ReceiveRequest::single(Duration::from_secs(20))).await?;
//! # let _ = (event_id, messages);
//! # Ok(())
//! # }
//! ```

pub mod dead_letter;
mod envelope;
mod inmemory_broker;
mod nats_transport;
mod publisher;
pub mod retry;

pub use dead_letter::{
    dead_letter_copy, DeadLetter, DeadLetterCopy, DeadLetterReason, DeadLetterRouter, RedrivePolicy,
};
pub use envelope::{decode_body, validate_envelope_fields, DecodeError, EventEnvelope};
pub use inmemory_broker::{InMemoryBroker, InMemoryQueue, SubscriptionConfig};
pub use nats_transport::{
    ensure_streams, ConsumerSetup, JetStreamQueue, JetStreamTopic, StreamSetup,
};
pub use publisher::{EventPublisher, PublishError, MAX_MESSAGE_BYTES};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Attribute carrying the event type on every published message.
///
/// Subscriptions filter on this attribute, so it must always be present.
pub const EVENT_TYPE_ATTRIBUTE: &str = "event_type";

/// A message handed to a [`Topic`] for fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    /// Serialized envelope
    pub body: Vec<u8>,
    /// String attributes used for subscription-side filtering
    pub attributes: HashMap<String, String>,
}

impl TopicMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn event_type(&self) -> Option<&str> {
        self.attributes.get(EVENT_TYPE_ATTRIBUTE).map(String::as_str)
    }
}

/// Opaque token proving current ownership of one delivery.
///
/// Only the most recent delivery's handle is valid; a handle from an earlier
/// delivery is stale once the message has been redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters of a single long-poll receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Upper bound on messages returned (at least 1)
    pub max_messages: u32,
    /// How long to wait for a message before returning an empty batch
    pub wait: Duration,
}

impl ReceiveRequest {
    pub fn new(max_messages: u32, wait: Duration) -> Self {
        Self {
            max_messages: max_messages.max(1),
            wait,
        }
    }

    /// One message per poll
    pub fn single(wait: Duration) -> Self {
        Self::new(1, wait)
    }
}

/// One delivery of a queued message
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Transport-assigned id, stable across redeliveries
    pub message_id: String,
    /// Required to delete this delivery or extend its visibility
    pub receipt_handle: ReceiptHandle,
    /// Raw body as stored by the transport
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// How many times the message has been delivered, starting at 1
    pub delivery_count: u32,
    /// Point after which the message becomes visible to other consumers again
    pub visibility_deadline: Instant,
}

impl QueueMessage {
    pub fn event_type(&self) -> Option<&str> {
        self.attributes.get(EVENT_TYPE_ATTRIBUTE).map(String::as_str)
    }
}

/// Errors that can occur when using a topic or queue
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to receive messages: {0}")]
    ReceiveError(String),

    #[error("failed to delete message: {0}")]
    DeleteError(String),

    #[error("receipt handle is stale or unknown: {0}")]
    StaleReceipt(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Fan-out publish side of the bus
#[async_trait]
pub trait Topic: Send + Sync {
    /// Publish one message. Success means the transport accepted it; there is
    /// no further acknowledgement.
    async fn publish(&self, message: TopicMessage) -> BusResult<()>;
}

/// One subscription's durable copy of the topic
#[async_trait]
pub trait Queue: Send + Sync {
    /// Long-poll for up to `request.max_messages` visible messages.
    ///
    /// Returns an empty batch when `request.wait` elapses with nothing visible.
    /// Each returned message is hidden from other consumers until its
    /// `visibility_deadline`.
    async fn receive(&self, request: ReceiveRequest) -> BusResult<Vec<QueueMessage>>;

    /// Remove a delivered message for good.
    ///
    /// Fails with [`BusError::StaleReceipt`] when the handle no longer owns the
    /// delivery (visibility expired and the message was handed out again).
    async fn delete(&self, receipt: &ReceiptHandle) -> BusResult<()>;

    /// Push the visibility deadline of a delivery `extension` into the future
    async fn extend_visibility(&self, receipt: &ReceiptHandle, extension: Duration)
        -> BusResult<()>;
}

impl fmt::Debug for dyn Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic")
    }
}

impl fmt::Debug for dyn Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue")
    }
}
