//! Dead-letter handling
//!
//! A message that keeps failing is removed from the live queue after a fixed
//! number of deliveries so it cannot occupy a consumer forever. This is a
//! property of the transport:
//!
//! - [`InMemoryBroker`](crate::InMemoryBroker) applies a [`RedrivePolicy`] per
//!   subscription on every receive.
//! - On JetStream the consumer is created with `max_deliver = M`; the server
//!   stops redelivering to that consumer and emits a max-deliveries advisory,
//!   which [`DeadLetterRouter`] turns into a copy on the dead-letter stream.
//!
//! Consumer code never calls into this module.

use async_nats::jetstream;
use async_nats::{Client, HeaderMap};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::nats_transport::StreamSetup;
use crate::{BusError, BusResult, EVENT_TYPE_ATTRIBUTE};

/// Header set on every message copied to the dead-letter stream
pub const DEAD_LETTER_REASON_HEADER: &str = "dead_letter_reason";
/// Header carrying the number of deliveries the message had when it was dead-lettered
pub const DELIVERY_COUNT_HEADER: &str = "delivery_count";

/// Maximum number of deliveries before a message is dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    /// A policy allowing at least one delivery
    pub fn new(max_receive_count: u32) -> Self {
        Self {
            max_receive_count: max_receive_count.max(1),
        }
    }

    /// True once a message that has been delivered `delivery_count` times may
    /// not be delivered again
    pub fn is_exhausted(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_receive_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    MaxDeliveries,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::MaxDeliveries => f.write_str("max_deliveries"),
        }
    }
}

/// A message moved out of the live queue
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: String,
    pub event_type: Option<String>,
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub delivery_count: u32,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Payload of `$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.<stream>.<consumer>`
#[derive(Debug, Clone, Deserialize)]
pub struct MaxDeliveriesAdvisory {
    pub stream: String,
    pub consumer: String,
    pub stream_seq: u64,
    pub deliveries: u32,
}

/// Subject and headers of the dead-letter copy of one live-stream message
#[derive(Debug, Clone)]
pub struct DeadLetterCopy {
    pub subject: String,
    pub event_type: Option<String>,
    pub headers: HeaderMap,
}

/// Build the dead-letter copy for a message read from `live_subject`
///
/// The event type comes from the `event_type` header, falling back to the
/// live subject; without either the copy goes to `<dead_letter_prefix>.unknown`.
pub fn dead_letter_copy(
    setup: &StreamSetup,
    live_subject: &str,
    live_headers: &HeaderMap,
    deliveries: u32,
) -> DeadLetterCopy {
    let event_type = live_headers
        .get(EVENT_TYPE_ATTRIBUTE)
        .map(|v| v.as_str().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| setup.event_type_of(live_subject).map(str::to_string));

    let subject = setup.dead_letter_subject(event_type.as_deref().unwrap_or("unknown"));

    let mut headers = HeaderMap::new();
    if let Some(event_type) = event_type.as_deref() {
        headers.insert(EVENT_TYPE_ATTRIBUTE, event_type);
    }
    headers.insert(
        DEAD_LETTER_REASON_HEADER,
        DeadLetterReason::MaxDeliveries.to_string().as_str(),
    );
    headers.insert(DELIVERY_COUNT_HEADER, deliveries.to_string().as_str());

    DeadLetterCopy {
        subject,
        event_type,
        headers,
    }
}

/// Copies exhausted JetStream messages to the dead-letter stream
///
/// Listens for the max-deliveries advisory of one durable consumer. For each
/// advisory the original message is read back from the live stream and
/// published to `<dead_letter_prefix>.<event_type>`.
///
/// The message is left in the live stream: other subscriptions are consumers
/// on the same stream and may not have processed it yet, and JetStream already
/// stopped redelivering it to this consumer.
///
/// Every worker of a subscription runs a router. They share one queue group,
/// so each advisory is routed once.
pub struct DeadLetterRouter {
    client: Client,
    jetstream: jetstream::Context,
    setup: StreamSetup,
    consumer_name: String,
}

impl DeadLetterRouter {
    pub fn new(client: Client, setup: StreamSetup, consumer_name: impl Into<String>) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            setup,
            consumer_name: consumer_name.into(),
        }
    }

    pub fn advisory_subject(&self) -> String {
        format!(
            "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.{}.{}",
            self.setup.stream_name, self.consumer_name
        )
    }

    /// Queue group shared by the routers of all workers on this consumer
    pub fn queue_group(&self) -> String {
        format!("{}-dlq-router", self.consumer_name)
    }

    /// Route advisories until `shutdown` is cancelled or the subscription ends
    pub async fn run(self, shutdown: CancellationToken) -> BusResult<()> {
        let subject = self.advisory_subject();
        let group = self.queue_group();
        let mut advisories = self
            .client
            .queue_subscribe(subject.clone(), group.clone())
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        info!(subject = %subject, queue_group = %group, "Dead-letter router listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = advisories.next() => {
                    let Some(msg) = next else { break };

                    let advisory: MaxDeliveriesAdvisory = match serde_json::from_slice(&msg.payload) {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "Unparseable max-deliveries advisory");
                            continue;
                        }
                    };

                    if let Err(e) = self.route(&advisory).await {
                        error!(
                            stream_seq = advisory.stream_seq,
                            deliveries = advisory.deliveries,
                            error = %e,
                            "Failed to copy exhausted message to the dead-letter stream"
                        );
                    }
                }
            }
        }

        info!("Dead-letter router stopped");
        Ok(())
    }

    /// Copy one exhausted message to the dead-letter stream
    pub async fn route(&self, advisory: &MaxDeliveriesAdvisory) -> BusResult<DeadLetter> {
        let stream = self
            .jetstream
            .get_stream(&self.setup.stream_name)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        let raw = stream
            .get_raw_message(advisory.stream_seq)
            .await
            .map_err(|e| BusError::ReceiveError(e.to_string()))?;

        let live_subject = raw.subject.to_string();
        let copy = dead_letter_copy(&self.setup, &live_subject, &raw.headers, advisory.deliveries);

        let mut attributes = HashMap::new();
        for (key, values) in raw.headers.iter() {
            if let Some(value) = values.first() {
                attributes.insert(key.to_string(), value.to_string());
            }
        }

        self.jetstream
            .publish_with_headers(copy.subject.clone(), copy.headers, raw.payload.clone())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        error!(
            stream_seq = advisory.stream_seq,
            subject = %live_subject,
            dead_letter_subject = %copy.subject,
            deliveries = advisory.deliveries,
            "Event copied to dead-letter stream after max deliveries"
        );

        Ok(DeadLetter {
            message_id: format!("{}:{}", advisory.stream, advisory.stream_seq),
            event_type: copy.event_type,
            body: raw.payload.to_vec(),
            attributes,
            delivery_count: advisory.deliveries,
            reason: DeadLetterReason::MaxDeliveries,
            dead_lettered_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redrive_policy_boundary() {
        let policy = RedrivePolicy::new(3);

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn test_redrive_policy_allows_one_delivery_minimum() {
        assert_eq!(RedrivePolicy::new(0).max_receive_count, 1);
    }

    #[test]
    fn test_parse_max_deliveries_advisory() {
        let raw = br#"{
            "type": "io.nats.jetstream.advisory.v1.max_deliver",
            "id": "abc",
            "timestamp": "2024-01-01T00:00:00Z",
            "stream": "CRM_EVENTS",
            "consumer": "lead-worker",
            "stream_seq": 42,
            "deliveries": 5
        }"#;

        let advisory: MaxDeliveriesAdvisory = serde_json::from_slice(raw).unwrap();
        assert_eq!(advisory.stream_seq, 42);
        assert_eq!(advisory.deliveries, 5);
        assert_eq!(advisory.consumer, "lead-worker");
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(DeadLetterReason::MaxDeliveries.to_string(), "max_deliveries");
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).map(|v| v.as_str())
    }

    #[test]
    fn test_dead_letter_copy_uses_event_type_header() {
        let setup = StreamSetup::default();
        let mut live = HeaderMap::new();
        live.insert(EVENT_TYPE_ATTRIBUTE, "Lead.New");

        let copy = dead_letter_copy(&setup, "crm.events.Lead.New", &live, 5);

        assert_eq!(copy.subject, "crm.dlq.Lead.New");
        assert_eq!(copy.event_type.as_deref(), Some("Lead.New"));
        assert_eq!(header(&copy.headers, EVENT_TYPE_ATTRIBUTE), Some("Lead.New"));
        assert_eq!(header(&copy.headers, DEAD_LETTER_REASON_HEADER), Some("max_deliveries"));
        assert_eq!(header(&copy.headers, DELIVERY_COUNT_HEADER), Some("5"));
    }

    #[test]
    fn test_dead_letter_copy_falls_back_to_live_subject() {
        let setup = StreamSetup::default();

        let copy = dead_letter_copy(&setup, "crm.events.Offer.Sent", &HeaderMap::new(), 3);

        assert_eq!(copy.subject, "crm.dlq.Offer.Sent");
        assert_eq!(header(&copy.headers, EVENT_TYPE_ATTRIBUTE), Some("Offer.Sent"));
        assert_eq!(header(&copy.headers, DELIVERY_COUNT_HEADER), Some("3"));
    }

    #[test]
    fn test_dead_letter_copy_without_event_type() {
        let setup = StreamSetup::default();

        let copy = dead_letter_copy(&setup, "elsewhere.thing", &HeaderMap::new(), 1);

        assert_eq!(copy.subject, "crm.dlq.unknown");
        assert!(copy.event_type.is_none());
        assert!(header(&copy.headers, EVENT_TYPE_ATTRIBUTE).is_none());
        assert_eq!(header(&copy.headers, DEAD_LETTER_REASON_HEADER), Some("max_deliveries"));
    }

    // Requires a running NATS server with JetStream enabled:
    // docker run -p 4222:4222 nats:2.10-alpine -js
    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_routed_message_stays_available_to_other_subscriptions() {
        use crate::nats_transport::{ensure_streams, ConsumerSetup, JetStreamQueue, JetStreamTopic};
        use crate::{Queue, ReceiveRequest, Topic, TopicMessage};
        use std::time::Duration;

        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let setup = StreamSetup {
            stream_name: "TEST_DLQ_ROUTE_EVENTS".to_string(),
            subject_prefix: "test.dlqroute.events".to_string(),
            dead_letter_stream: "TEST_DLQ_ROUTE_DLQ".to_string(),
            dead_letter_prefix: "test.dlqroute.dlq".to_string(),
            ..Default::default()
        };
        let js = jetstream::new(client.clone());
        let _ = js.delete_stream(&setup.stream_name).await;
        let _ = js.delete_stream(&setup.dead_letter_stream).await;
        ensure_streams(client.clone(), &setup).await.unwrap();

        async fn bind(
            client: &Client,
            setup: &StreamSetup,
            name: &str,
            event_types: Vec<String>,
        ) -> JetStreamQueue {
            let consumer = ConsumerSetup {
                consumer_name: name.to_string(),
                event_types,
                visibility_timeout: Duration::from_secs(30),
                max_deliveries: 3,
            };
            JetStreamQueue::bind(client.clone(), setup, &consumer)
                .await
                .unwrap()
        }
        let leads = bind(&client, &setup, "test-dlq-leads", vec!["Lead.New".to_string()]).await;
        let audit = bind(&client, &setup, "test-dlq-audit", Vec::new()).await;

        JetStreamTopic::new(client.clone(), setup.clone())
            .publish(
                TopicMessage::new(b"{}".to_vec()).with_attribute(EVENT_TYPE_ATTRIBUTE, "Lead.New"),
            )
            .await
            .unwrap();

        let exhausted = leads
            .receive(ReceiveRequest::single(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(exhausted.len(), 1);
        let stream_seq: u64 = exhausted[0]
            .message_id
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        let router = DeadLetterRouter::new(client, setup.clone(), "test-dlq-leads");
        assert_eq!(router.queue_group(), "test-dlq-leads-dlq-router");

        let dead = router
            .route(&MaxDeliveriesAdvisory {
                stream: setup.stream_name.clone(),
                consumer: "test-dlq-leads".to_string(),
                stream_seq,
                deliveries: 3,
            })
            .await
            .unwrap();
        assert_eq!(dead.event_type.as_deref(), Some("Lead.New"));

        let other = audit
            .receive(ReceiveRequest::single(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].message_id, exhausted[0].message_id);
    }
}
