//! Lead.New worker
//!
//! Wires the lead handler, the idempotency ledger and the audit trail into a
//! [`HandlerRegistry`] for the consumer loop. `main.rs` picks the transport and
//! storage from [`config::Config`].

pub mod audit;
pub mod config;
pub mod handlers;
pub mod models;

use event_consumer::{HandlerRegistry, IdempotentHandler, ProcessedEvents};
use std::sync::Arc;

use crate::audit::AuditLog;
use crate::handlers::LeadCreatedHandler;
use crate::models::LEAD_NEW;

/// Handlers this worker consumes, each behind the processed-event ledger
pub fn build_registry(
    audit: Arc<dyn AuditLog>,
    ledger: Arc<dyn ProcessedEvents>,
    consumer_name: &str,
) -> HandlerRegistry {
    let lead_created = IdempotentHandler::new(LeadCreatedHandler::new(audit), ledger, consumer_name);

    HandlerRegistry::new().with_handler(LEAD_NEW, Arc::new(lead_created))
}
