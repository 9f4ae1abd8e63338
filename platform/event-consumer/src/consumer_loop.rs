//! Long-poll consumer loop
//!
//! ```text
//! POLL -> (empty)    -> BACKOFF (fixed) -> POLL
//! POLL -> (error)    -> BACKOFF (longer) -> POLL
//! POLL -> (messages) -> PROCESS(each) -> DELETE | LEAVE_FOR_REDELIVERY -> POLL
//! ```
//!
//! Messages are processed one at a time, to completion, before the next
//! poll. A failed message is simply not deleted: the queue hands it out
//! again once its visibility deadline passes, and moves it to the dead-letter
//! location after `max_deliveries` attempts. The loop itself never retries
//! and never routes dead letters.

use event_bus::{decode_body, BusError, EventEnvelope, Queue, QueueMessage, ReceiveRequest};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{ConsumerMetrics, EventContext, HandlerRegistry};

/// Tuning for [`ConsumerLoop`]
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Messages requested per poll
    pub max_messages: u32,
    /// Long-poll wait per receive
    pub wait: Duration,
    /// Pause after an empty poll; constant, never grows
    pub empty_poll_backoff: Duration,
    /// Pause after the queue itself could not be reached
    pub queue_error_backoff: Duration,
    /// Delivery limit configured on the queue. Only used to flag the final
    /// attempt in logs; the queue enforces it.
    pub max_deliveries: u32,
    /// Log a line every this many consecutive empty polls
    pub empty_poll_log_every: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait: Duration::from_secs(20),
            empty_poll_backoff: Duration::from_secs(1),
            queue_error_backoff: Duration::from_secs(5),
            max_deliveries: 5,
            empty_poll_log_every: 10,
        }
    }
}

/// Why a message was left on the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryReason {
    /// Body is not a valid envelope
    DecodeFailed(String),
    /// The registered handler returned an error
    HandlerFailed(String),
}

impl fmt::Display for RedeliveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedeliveryReason::DecodeFailed(e) => write!(f, "decode failed: {e}"),
            RedeliveryReason::HandlerFailed(e) => write!(f, "handler failed: {e}"),
        }
    }
}

/// What happened to one delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Handled and removed from the queue
    Deleted,
    /// No handler for the event type; removed without handling
    Skipped,
    /// Not deleted; the queue will redeliver it
    LeftForRedelivery { reason: RedeliveryReason },
    /// Handled (or skipped) but the delete call failed; expect a redelivery
    DeleteFailed,
}

impl MessageOutcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            MessageOutcome::Deleted => "deleted",
            MessageOutcome::Skipped => "skipped",
            MessageOutcome::LeftForRedelivery { .. } => "left_for_redelivery",
            MessageOutcome::DeleteFailed => "delete_failed",
        }
    }
}

/// Outcomes of one received batch, in receive order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<MessageOutcome>,
}

impl BatchReport {
    fn count(&self, label: &str) -> u64 {
        self.outcomes.iter().filter(|o| o.as_label() == label).count() as u64
    }

    pub fn deleted(&self) -> u64 {
        self.count("deleted")
    }

    pub fn skipped(&self) -> u64 {
        self.count("skipped")
    }

    pub fn left_for_redelivery(&self) -> u64 {
        self.count("left_for_redelivery")
    }

    pub fn delete_failed(&self) -> u64 {
        self.count("delete_failed")
    }
}

/// Result of a single [`ConsumerLoop::poll_once`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Empty,
    Processed(BatchReport),
    QueueUnavailable,
}

/// Totals reported by [`ConsumerLoop::run`] when it stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub polls: u64,
    pub empty_polls: u64,
    pub queue_errors: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub left_for_redelivery: u64,
    pub delete_failed: u64,
}

impl LoopStats {
    fn record(&mut self, report: &BatchReport) {
        self.deleted += report.deleted();
        self.skipped += report.skipped();
        self.left_for_redelivery += report.left_for_redelivery();
        self.delete_failed += report.delete_failed();
    }
}

/// Sequential consumer for one queue subscription
pub struct ConsumerLoop {
    queue: Arc<dyn Queue>,
    registry: HandlerRegistry,
    config: ConsumerConfig,
    metrics: Option<ConsumerMetrics>,
}

impl ConsumerLoop {
    pub fn new(queue: Arc<dyn Queue>, registry: HandlerRegistry, config: ConsumerConfig) -> Self {
        Self {
            queue,
            registry,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation is observed while waiting on the queue and during
    /// backoff, never in the middle of processing a message.
    pub async fn run(&self, shutdown: CancellationToken) -> LoopStats {
        let mut stats = LoopStats::default();
        let mut consecutive_empty: u64 = 0;
        let mut consecutive_errors: u64 = 0;

        info!(
            event_types = ?self.registry.event_types(),
            wait_secs = self.config.wait.as_secs(),
            max_deliveries = self.config.max_deliveries,
            "Consumer loop started"
        );

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.receive_batch() => received,
            };
            stats.polls += 1;

            let backoff = match received {
                Ok(messages) if messages.is_empty() => {
                    stats.empty_polls += 1;
                    consecutive_empty += 1;
                    consecutive_errors = 0;

                    if consecutive_empty % self.config.empty_poll_log_every.max(1) == 0 {
                        debug!(consecutive_empty, "No messages received");
                    }
                    Some(self.config.empty_poll_backoff)
                }
                Ok(messages) => {
                    consecutive_empty = 0;
                    consecutive_errors = 0;

                    let report = self.process_batch(&messages).await;
                    stats.record(&report);
                    None
                }
                Err(_) => {
                    stats.queue_errors += 1;
                    consecutive_errors += 1;

                    warn!(
                        consecutive_errors,
                        backoff_ms = self.config.queue_error_backoff.as_millis() as u64,
                        "Queue unavailable, backing off"
                    );
                    Some(self.config.queue_error_backoff)
                }
            };

            if let Some(delay) = backoff {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }

        info!(
            polls = stats.polls,
            deleted = stats.deleted,
            left_for_redelivery = stats.left_for_redelivery,
            queue_errors = stats.queue_errors,
            "Consumer loop stopped"
        );

        stats
    }

    /// One POLL followed by PROCESS of everything received
    pub async fn poll_once(&self) -> PollOutcome {
        match self.receive_batch().await {
            Ok(messages) if messages.is_empty() => PollOutcome::Empty,
            Ok(messages) => PollOutcome::Processed(self.process_batch(&messages).await),
            Err(_) => PollOutcome::QueueUnavailable,
        }
    }

    async fn receive_batch(&self) -> Result<Vec<QueueMessage>, BusError> {
        let request = ReceiveRequest::new(self.config.max_messages, self.config.wait);

        let result = self.queue.receive(request).await;
        let label = match &result {
            Ok(messages) if messages.is_empty() => "empty",
            Ok(_) => "messages",
            Err(e) => {
                error!(error = %e, "Failed to receive from queue");
                "error"
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_poll(label);
        }

        result
    }

    /// A failure on one message never stops the rest of the batch
    async fn process_batch(&self, messages: &[QueueMessage]) -> BatchReport {
        let mut report = BatchReport::default();
        for message in messages {
            report.outcomes.push(self.process_message(message).await);
        }
        report
    }

    /// Decide and apply the fate of one delivered message
    pub async fn process_message(&self, message: &QueueMessage) -> MessageOutcome {
        let outcome = match decode_body(&message.body) {
            Ok(envelope) => {
                let span = tracing::info_span!(
                    "process_event",
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    tenant_id = %envelope.tenant_id,
                    delivery_attempt = message.delivery_count,
                    message_id = %message.message_id,
                    correlation_id = %envelope.correlation_id.as_deref().unwrap_or("none"),
                );
                self.dispatch(message, &envelope).instrument(span).await
            }
            Err(e) => {
                error!(
                    message_id = %message.message_id,
                    delivery_attempt = message.delivery_count,
                    max_deliveries = self.config.max_deliveries,
                    error = %e,
                    "Failed to decode message body, leaving for redelivery"
                );
                MessageOutcome::LeftForRedelivery {
                    reason: RedeliveryReason::DecodeFailed(e.to_string()),
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_message(message.event_type().unwrap_or("unknown"), outcome.as_label());
        }

        outcome
    }

    async fn dispatch(&self, message: &QueueMessage, envelope: &EventEnvelope<Value>) -> MessageOutcome {
        let Some(handler) = self.registry.lookup(&envelope.event_type) else {
            warn!("No handler registered for event type, deleting message");
            return if self.delete(message).await {
                MessageOutcome::Skipped
            } else {
                MessageOutcome::DeleteFailed
            };
        };

        let ctx = EventContext::from_delivery(envelope, message);

        match handler.handle(&ctx, &envelope.payload).await {
            Ok(()) => {
                if self.delete(message).await {
                    debug!("Event handled and deleted");
                    MessageOutcome::Deleted
                } else {
                    MessageOutcome::DeleteFailed
                }
            }
            Err(e) => {
                if ctx.delivery_attempt >= self.config.max_deliveries {
                    error!(
                        error = %e,
                        max_deliveries = self.config.max_deliveries,
                        "Handler failed on final delivery, message will be dead-lettered"
                    );
                } else {
                    warn!(
                        error = %e,
                        max_deliveries = self.config.max_deliveries,
                        "Handler failed, leaving message for redelivery"
                    );
                }
                MessageOutcome::LeftForRedelivery {
                    reason: RedeliveryReason::HandlerFailed(e.to_string()),
                }
            }
        }
    }

    async fn delete(&self, message: &QueueMessage) -> bool {
        match self.queue.delete(&message.receipt_handle).await {
            Ok(()) => true,
            Err(BusError::StaleReceipt(_)) => {
                warn!(
                    message_id = %message.message_id,
                    "Receipt handle went stale before delete, message will be redelivered"
                );
                false
            }
            Err(e) => {
                error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to delete message, it will be redelivered"
                );
                false
            }
        }
    }
}
