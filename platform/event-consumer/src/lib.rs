//! # Event Consumer
//!
//! Consumer side of the domain-event pipeline. A [`ConsumerLoop`] long-polls
//! one [`Queue`](event_bus::Queue), decodes each message into an
//! [`EventEnvelope`](event_bus::EventEnvelope), dispatches it by
//! `event_type` through a [`HandlerRegistry`], and deletes it only after the
//! handler succeeded.
//!
//! Delivery is at-least-once. Handlers are expected to be idempotent on
//! `event_id`; [`IdempotentHandler`] adds that on top of any handler using a
//! [`ProcessedEvents`] ledger.
//!
//! ```rust,no_run
//! use event_bus::{InMemoryBroker, SubscriptionConfig};
//! use event_consumer::{ConsumerConfig, ConsumerLoop, HandlerRegistry};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let broker = InMemoryBroker::new();
//! let queue = broker.subscribe(SubscriptionConfig::new("lead-worker"));
//!
//! let consumer = ConsumerLoop::new(Arc::new(queue), HandlerRegistry::new(), ConsumerConfig::default());
//! let shutdown = CancellationToken::new();
//! let stats = consumer.run(shutdown).await;
//! # let _ = stats;
//! # }
//! ```

mod consumer_loop;
mod context;
mod handler;
mod idempotency;
mod metrics;
mod registry;

pub use consumer_loop::{
    BatchReport, ConsumerConfig, ConsumerLoop, LoopStats, MessageOutcome, PollOutcome,
    RedeliveryReason,
};
pub use context::EventContext;
pub use handler::{EventHandler, HandlerError};
pub use idempotency::{
    IdempotentHandler, InMemoryProcessedEvents, PgProcessedEvents, ProcessedEvents,
};
pub use metrics::ConsumerMetrics;
pub use registry::HandlerRegistry;
