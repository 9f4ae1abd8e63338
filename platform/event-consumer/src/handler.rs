//! Handler contract for consumed events.

use async_trait::async_trait;
use serde_json::Value;

use crate::EventContext;

/// Why a handler could not finish.
///
/// The consumer loop treats every variant the same way: the message is left
/// on the queue and redelivered. Permanent failures therefore end up on the
/// dead-letter path once the delivery limit is reached.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("payload does not match the event type: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for HandlerError {
    fn from(e: sqlx::Error) -> Self {
        HandlerError::Store(e.to_string())
    }
}

/// Processes one event type.
///
/// Implementations must be idempotent with respect to `ctx.event_id`: the
/// queue delivers at least once, so the same event can arrive again after a
/// success whose delete was lost. Wrap a handler in
/// [`IdempotentHandler`](crate::IdempotentHandler) to get this from the
/// processed-event ledger.
///
/// A handler must return `Err` for anything it wants retried and must not
/// assume retries are unlimited.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &EventContext, payload: &Value) -> Result<(), HandlerError>;
}
