//! Processed-event ledger and the handler wrapper that consults it.
//!
//! The queue may deliver an `event_id` more than once (a success whose delete
//! was lost, a visibility window that expired mid-handler). The ledger records
//! every event a consumer finished so the next delivery becomes a no-op.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{EventContext, EventHandler, HandlerError};

/// Storage for event ids a consumer has already handled
#[async_trait]
pub trait ProcessedEvents: Send + Sync {
    async fn is_processed(&self, event_id: Uuid) -> Result<bool, HandlerError>;

    /// Record `event_id` as handled; recording it twice is not an error
    async fn mark_processed(
        &self,
        event_id: Uuid,
        event_type: &str,
        consumer: &str,
    ) -> Result<(), HandlerError>;
}

/// Ledger kept in process memory (tests, local runs without a database)
#[derive(Clone, Default)]
pub struct InMemoryProcessedEvents {
    seen: Arc<Mutex<HashMap<Uuid, (String, String)>>>,
}

impl InMemoryProcessedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ProcessedEvents for InMemoryProcessedEvents {
    async fn is_processed(&self, event_id: Uuid) -> Result<bool, HandlerError> {
        Ok(self.seen.lock().await.contains_key(&event_id))
    }

    async fn mark_processed(
        &self,
        event_id: Uuid,
        event_type: &str,
        consumer: &str,
    ) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .await
            .entry(event_id)
            .or_insert_with(|| (event_type.to_string(), consumer.to_string()));
        Ok(())
    }
}

/// Ledger in the `processed_events` table
#[derive(Clone)]
pub struct PgProcessedEvents {
    pool: PgPool,
}

impl PgProcessedEvents {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEvents for PgProcessedEvents {
    async fn is_processed(&self, event_id: Uuid) -> Result<bool, HandlerError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT event_id FROM processed_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn mark_processed(
        &self,
        event_id: Uuid,
        event_type: &str,
        consumer: &str,
    ) -> Result<(), HandlerError> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, consumer)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(consumer)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Wraps a handler so each `event_id` takes effect at most once per consumer
///
/// - already in the ledger: success, inner handler not called
/// - inner handler succeeds: event recorded
/// - inner handler fails: nothing recorded, the redelivery runs it again
pub struct IdempotentHandler<H> {
    inner: H,
    ledger: Arc<dyn ProcessedEvents>,
    consumer: String,
}

impl<H: EventHandler> IdempotentHandler<H> {
    pub fn new(inner: H, ledger: Arc<dyn ProcessedEvents>, consumer: impl Into<String>) -> Self {
        Self {
            inner,
            ledger,
            consumer: consumer.into(),
        }
    }
}

#[async_trait]
impl<H: EventHandler> EventHandler for IdempotentHandler<H> {
    async fn handle(&self, ctx: &EventContext, payload: &Value) -> Result<(), HandlerError> {
        if self.ledger.is_processed(ctx.event_id).await? {
            tracing::info!(
                event_id = %ctx.event_id,
                delivery_attempt = ctx.delivery_attempt,
                "Event already processed, skipping"
            );
            return Ok(());
        }

        self.inner.handle(ctx, payload).await?;

        self.ledger
            .mark_processed(ctx.event_id, &ctx.event_type, &self.consumer)
            .await
    }
}
