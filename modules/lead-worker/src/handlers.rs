use async_trait::async_trait;
use event_consumer::{EventContext, EventHandler, HandlerError};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::audit::AuditLog;
use crate::models::{AuditEntry, LeadCreatedPayload};

const LEAD_CREATED_ACTION: &str = "lead.created";
const SYSTEM_USER: &str = "system";

/// Handles `Lead.New`: validates the lead and records it in the workspace audit trail
pub struct LeadCreatedHandler {
    audit: Arc<dyn AuditLog>,
}

impl LeadCreatedHandler {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl EventHandler for LeadCreatedHandler {
    async fn handle(&self, ctx: &EventContext, payload: &Value) -> Result<(), HandlerError> {
        let lead: LeadCreatedPayload = serde_json::from_value(payload.clone())?;

        if lead.id.trim().is_empty() {
            return Err(HandlerError::Permanent("lead id is empty".to_string()));
        }
        if !lead.email.contains('@') {
            return Err(HandlerError::Permanent(format!(
                "lead {} has invalid email",
                lead.id
            )));
        }

        tracing::info!(
            lead_id = %lead.id,
            status = %lead.status,
            source = %lead.source.as_deref().unwrap_or("unknown"),
            "Processing new lead"
        );

        let entry = AuditEntry {
            event_id: ctx.event_id,
            workspace_id: ctx.tenant_id.clone(),
            user_id: SYSTEM_USER.to_string(),
            action: LEAD_CREATED_ACTION.to_string(),
            target_id: Some(lead.id.clone()),
            metadata: json!({
                "name": lead.name,
                "email": lead.email,
                "status": lead.status,
                "source": lead.source,
                "source_module": ctx.source_module,
                "correlation_id": ctx.correlation_id,
            }),
        };

        if !self.audit.record(&entry).await? {
            tracing::debug!(lead_id = %lead.id, "Audit entry already present");
        }

        Ok(())
    }
}
