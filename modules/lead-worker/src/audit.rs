//! Workspace audit trail written by event handlers.

use async_trait::async_trait;
use event_consumer::HandlerError;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::AuditEntry;

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append `entry`. Returns false when an entry for the same event and
    /// action already exists.
    async fn record(&self, entry: &AuditEntry) -> Result<bool, HandlerError>;
}

/// `audit_log` table
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<bool, HandlerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log (id, event_id, workspace_id, user_id, action, target_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id, action) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.event_id)
        .bind(&entry.workspace_id)
        .bind(&entry.user_id)
        .bind(&entry.action)
        .bind(&entry.target_id)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Audit trail in process memory
#[derive(Clone, Default)]
pub struct InMemoryAuditLog {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn entries_for(&self, workspace_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.workspace_id == workspace_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<bool, HandlerError> {
        let mut entries = self.entries.lock().await;
        let exists = entries
            .iter()
            .any(|e| e.event_id == entry.event_id && e.action == entry.action);
        if exists {
            return Ok(false);
        }
        entries.push(entry.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(event_id: Uuid, workspace: &str) -> AuditEntry {
        AuditEntry {
            event_id,
            workspace_id: workspace.to_string(),
            user_id: "system".to_string(),
            action: "lead.created".to_string(),
            target_id: Some("L1".to_string()),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_same_event_recorded_once() {
        let log = InMemoryAuditLog::new();
        let event_id = Uuid::new_v4();

        assert!(log.record(&entry(event_id, "ws-1")).await.unwrap());
        assert!(!log.record(&entry(event_id, "ws-1")).await.unwrap());

        assert_eq!(log.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_scoped_by_workspace() {
        let log = InMemoryAuditLog::new();
        log.record(&entry(Uuid::new_v4(), "ws-1")).await.unwrap();
        log.record(&entry(Uuid::new_v4(), "ws-2")).await.unwrap();

        assert_eq!(log.entries_for("ws-1").await.len(), 1);
        assert_eq!(log.entries_for("ws-3").await.len(), 0);
    }
}
