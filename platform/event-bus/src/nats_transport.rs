//! NATS JetStream implementation of the Topic and Queue traits
//!
//! - The topic is a JetStream stream capturing `<subject_prefix>.>`. An event of
//!   type `Lead.New` is published on `<subject_prefix>.Lead.New`, so per-type
//!   subscription filtering is plain subject filtering.
//! - A queue is a durable pull consumer on that stream with explicit acks.
//!   `ack_wait` is the visibility timeout, `max_deliver` the dead-letter
//!   threshold, and the delivery count comes from JetStream metadata.

use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, stream::Config};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    BusError, BusResult, Queue, QueueMessage, ReceiptHandle, ReceiveRequest, Topic, TopicMessage,
    EVENT_TYPE_ATTRIBUTE,
};

/// Names and retention of the live and dead-letter streams
#[derive(Debug, Clone)]
pub struct StreamSetup {
    pub stream_name: String,
    pub subject_prefix: String,
    pub dead_letter_stream: String,
    pub dead_letter_prefix: String,
    pub max_age: Duration,
    pub dead_letter_max_age: Duration,
}

impl Default for StreamSetup {
    fn default() -> Self {
        Self {
            stream_name: "CRM_EVENTS".to_string(),
            subject_prefix: "crm.events".to_string(),
            dead_letter_stream: "CRM_DLQ".to_string(),
            dead_letter_prefix: "crm.dlq".to_string(),
            max_age: Duration::from_secs(60 * 60 * 24 * 14), // 14 days
            dead_letter_max_age: Duration::from_secs(60 * 60 * 24 * 30), // 30 days
        }
    }
}

impl StreamSetup {
    pub fn subject_for(&self, event_type: &str) -> String {
        format!("{}.{}", self.subject_prefix, event_type)
    }

    pub fn dead_letter_subject(&self, event_type: &str) -> String {
        format!("{}.{}", self.dead_letter_prefix, event_type)
    }

    /// Recover the event type from a live-stream subject
    pub fn event_type_of<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.subject_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|rest| !rest.is_empty())
    }
}

/// Create the live and dead-letter streams if they do not exist yet
pub async fn ensure_streams(client: Client, setup: &StreamSetup) -> BusResult<()> {
    let js = jetstream::new(client);

    let events_cfg = Config {
        name: setup.stream_name.clone(),
        subjects: vec![format!("{}.>", setup.subject_prefix)],
        max_age: setup.max_age,
        ..Default::default()
    };

    if js.get_stream(&setup.stream_name).await.is_err() {
        js.create_stream(events_cfg)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        tracing::info!(stream = %setup.stream_name, "Created event stream");
    }

    let dlq_cfg = Config {
        name: setup.dead_letter_stream.clone(),
        subjects: vec![format!("{}.>", setup.dead_letter_prefix)],
        max_age: setup.dead_letter_max_age,
        ..Default::default()
    };

    if js.get_stream(&setup.dead_letter_stream).await.is_err() {
        js.create_stream(dlq_cfg)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        tracing::info!(stream = %setup.dead_letter_stream, "Created dead-letter stream");
    }

    Ok(())
}

/// Event types become subject tokens, so they must not contain wildcards or whitespace.
fn validate_event_type_token(event_type: &str) -> BusResult<()> {
    let invalid = event_type.is_empty()
        || event_type.starts_with('.')
        || event_type.ends_with('.')
        || event_type.contains("..")
        || event_type
            .chars()
            .any(|c| c == '*' || c == '>' || c.is_whitespace());

    if invalid {
        return Err(BusError::InvalidSubject(event_type.to_string()));
    }
    Ok(())
}

/// Publish side on JetStream
#[derive(Clone)]
pub struct JetStreamTopic {
    jetstream: jetstream::Context,
    setup: StreamSetup,
}

impl JetStreamTopic {
    pub fn new(client: Client, setup: StreamSetup) -> Self {
        Self {
            jetstream: jetstream::new(client),
            setup,
        }
    }
}

#[async_trait]
impl Topic for JetStreamTopic {
    async fn publish(&self, message: TopicMessage) -> BusResult<()> {
        let event_type = message
            .event_type()
            .ok_or_else(|| BusError::InvalidSubject("missing event_type attribute".to_string()))?;
        validate_event_type_token(event_type)?;

        let subject = self.setup.subject_for(event_type);

        let mut headers = HeaderMap::new();
        for (key, value) in &message.attributes {
            headers.insert(key.as_str(), value.as_str());
        }

        // Wait for the stream ack so "published" means "durably stored".
        self.jetstream
            .publish_with_headers(subject, headers, message.body.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }
}

/// Settings for the durable pull consumer behind a [`JetStreamQueue`]
#[derive(Debug, Clone)]
pub struct ConsumerSetup {
    pub consumer_name: String,
    /// Event types this subscription receives; empty means all
    pub event_types: Vec<String>,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
}

/// Receive side on JetStream
#[derive(Clone)]
pub struct JetStreamQueue {
    client: Client,
    consumer: jetstream::consumer::PullConsumer,
    setup: StreamSetup,
    visibility_timeout: Duration,
}

impl JetStreamQueue {
    /// Bind to (creating if needed) the durable consumer described by `consumer`
    pub async fn bind(
        client: Client,
        setup: &StreamSetup,
        consumer: &ConsumerSetup,
    ) -> BusResult<Self> {
        let js = jetstream::new(client.clone());
        let stream = js
            .get_stream(&setup.stream_name)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let filter_subjects = if consumer.event_types.is_empty() {
            vec![format!("{}.>", setup.subject_prefix)]
        } else {
            for event_type in &consumer.event_types {
                validate_event_type_token(event_type)?;
            }
            consumer
                .event_types
                .iter()
                .map(|t| setup.subject_for(t))
                .collect()
        };

        let config = pull::Config {
            durable_name: Some(consumer.consumer_name.clone()),
            ack_policy: AckPolicy::Explicit,
            ack_wait: consumer.visibility_timeout,
            max_deliver: i64::from(consumer.max_deliveries.max(1)),
            filter_subjects,
            ..Default::default()
        };

        let pull_consumer = stream
            .get_or_create_consumer(&consumer.consumer_name, config)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        tracing::info!(
            stream = %setup.stream_name,
            consumer = %consumer.consumer_name,
            max_deliveries = consumer.max_deliveries,
            "Bound durable pull consumer"
        );

        Ok(Self {
            client,
            consumer: pull_consumer,
            setup: setup.clone(),
            visibility_timeout: consumer.visibility_timeout,
        })
    }
}

impl JetStreamQueue {
    fn to_queue_message(&self, msg: &jetstream::Message) -> BusResult<QueueMessage> {
        let received_at = Instant::now();

        let info = msg
            .info()
            .map_err(|e| BusError::ReceiveError(e.to_string()))?;
        let message_id = format!("{}:{}", info.stream, info.stream_sequence);
        let delivery_count = u32::try_from(info.delivered.max(1)).unwrap_or(u32::MAX);

        let receipt_handle = msg
            .reply
            .as_ref()
            .map(|reply| ReceiptHandle::new(reply.to_string()))
            .ok_or_else(|| BusError::ReceiveError("message has no ack subject".to_string()))?;

        let mut attributes = HashMap::new();
        if let Some(nats_headers) = msg.headers.as_ref() {
            for (key, values) in nats_headers.iter() {
                if let Some(value) = values.first() {
                    attributes.insert(key.to_string(), value.to_string());
                }
            }
        }
        if !attributes.contains_key(EVENT_TYPE_ATTRIBUTE) {
            if let Some(event_type) = self.setup.event_type_of(&msg.subject) {
                attributes.insert(EVENT_TYPE_ATTRIBUTE.to_string(), event_type.to_string());
            }
        }

        Ok(QueueMessage {
            message_id,
            receipt_handle,
            body: msg.payload.to_vec(),
            attributes,
            delivery_count,
            visibility_deadline: received_at + self.visibility_timeout,
        })
    }
}

/// Drain one pull batch
///
/// A failure before anything arrived is a receive error. A failure part-way
/// keeps what was already pulled: those messages were charged a delivery and
/// must reach a handler.
async fn collect_batch<S, T, E>(mut batch: S) -> BusResult<Vec<T>>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: fmt::Display,
{
    let mut pulled = Vec::new();
    while let Some(next) = batch.next().await {
        match next {
            Ok(item) => pulled.push(item),
            Err(e) if pulled.is_empty() => return Err(BusError::ReceiveError(e.to_string())),
            Err(e) => {
                tracing::warn!(
                    pulled = pulled.len(),
                    error = %e,
                    "Pull batch failed part-way, keeping messages already received"
                );
                break;
            }
        }
    }
    Ok(pulled)
}

#[async_trait]
impl Queue for JetStreamQueue {
    async fn receive(&self, request: ReceiveRequest) -> BusResult<Vec<QueueMessage>> {
        let batch = self
            .consumer
            .batch()
            .max_messages(request.max_messages as usize)
            .expires(request.wait)
            .messages()
            .await
            .map_err(|e| BusError::ReceiveError(e.to_string()))?;

        let pulled = collect_batch(batch).await?;

        let mut received = Vec::with_capacity(pulled.len());
        for msg in &pulled {
            match self.to_queue_message(msg) {
                Ok(message) => received.push(message),
                // Left unacked; JetStream redelivers it after ack_wait
                Err(e) => tracing::warn!(
                    subject = %msg.subject,
                    error = %e,
                    "Skipping unusable JetStream message"
                ),
            }
        }

        Ok(received)
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> BusResult<()> {
        // Synchronous ack: the server answers once the ack is recorded.
        self.client
            .request(receipt.as_str().to_string(), "+ACK".into())
            .await
            .map_err(|e| BusError::DeleteError(e.to_string()))?;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        _extension: Duration,
    ) -> BusResult<()> {
        // JetStream only supports resetting the deadline to a full ack_wait.
        self.client
            .publish(receipt.as_str().to_string(), "+WPI".into())
            .await
            .map_err(|e| BusError::InternalError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_from_setup() {
        let setup = StreamSetup::default();

        assert_eq!(setup.subject_for("Lead.New"), "crm.events.Lead.New");
        assert_eq!(setup.dead_letter_subject("Lead.New"), "crm.dlq.Lead.New");
        assert_eq!(setup.event_type_of("crm.events.Lead.New"), Some("Lead.New"));
        assert_eq!(setup.event_type_of("crm.events"), None);
        assert_eq!(setup.event_type_of("other.Lead.New"), None);
    }

    #[tokio::test]
    async fn test_collect_batch_keeps_messages_before_a_failure() {
        let batch = futures::stream::iter(vec![Ok(1), Ok(2), Err("connection reset"), Ok(3)]);

        let pulled = collect_batch(batch).await.unwrap();

        assert_eq!(pulled, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_collect_batch_fails_when_nothing_arrived() {
        let batch = futures::stream::iter(vec![Err::<u32, _>("connection reset"), Ok(1)]);

        let err = collect_batch(batch).await.unwrap_err();

        assert!(matches!(err, BusError::ReceiveError(_)));
    }

    #[tokio::test]
    async fn test_collect_batch_empty_pull() {
        let batch = futures::stream::iter(Vec::<Result<u32, String>>::new());

        assert!(collect_batch(batch).await.unwrap().is_empty());
    }

    #[test]
    fn test_event_type_token_validation() {
        assert!(validate_event_type_token("Lead.New").is_ok());
        assert!(validate_event_type_token("Offer.Accepted").is_ok());
        assert!(validate_event_type_token("").is_err());
        assert!(validate_event_type_token("Lead.*").is_err());
        assert!(validate_event_type_token("Lead.>").is_err());
        assert!(validate_event_type_token("Lead..New").is_err());
        assert!(validate_event_type_token("Lead New").is_err());
    }

    // Note: These tests require a running NATS server with JetStream enabled
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_jetstream_publish_receive_delete() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let setup = StreamSetup {
            stream_name: "TEST_CRM_EVENTS".to_string(),
            subject_prefix: "test.crm.events".to_string(),
            dead_letter_stream: "TEST_CRM_DLQ".to_string(),
            dead_letter_prefix: "test.crm.dlq".to_string(),
            ..Default::default()
        };
        ensure_streams(client.clone(), &setup).await.unwrap();

        let queue = JetStreamQueue::bind(
            client.clone(),
            &setup,
            &ConsumerSetup {
                consumer_name: "test-lead-worker".to_string(),
                event_types: vec!["Lead.New".to_string()],
                visibility_timeout: Duration::from_secs(30),
                max_deliveries: 3,
            },
        )
        .await
        .unwrap();

        let topic = JetStreamTopic::new(client, setup);
        topic
            .publish(
                TopicMessage::new(b"{}".to_vec()).with_attribute(EVENT_TYPE_ATTRIBUTE, "Lead.New"),
            )
            .await
            .unwrap();

        let messages = queue
            .receive(ReceiveRequest::single(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].delivery_count, 1);
        assert_eq!(messages[0].event_type(), Some("Lead.New"));

        queue.delete(&messages[0].receipt_handle).await.unwrap();
    }
}
