use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type handled by this worker
pub const LEAD_NEW: &str = "Lead.New";

/// Payload of a `Lead.New` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadCreatedPayload {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Present on legacy events; the envelope's tenant_id is authoritative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

/// One row of the workspace audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Event that produced the entry; (event_id, action) is unique
    pub event_id: uuid::Uuid,
    pub workspace_id: String,
    pub user_id: String,
    pub action: String,
    pub target_id: Option<String>,
    pub metadata: serde_json::Value,
}
