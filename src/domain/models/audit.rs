//! Append-only audit trail.
//!
//! Every operation that changes persistent state produces exactly one entry
//! with a non-null actor. Entries are never updated or deleted inside their
//! retention window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::DataClassification;

fn default_retention_days() -> u32 {
    365
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    /// Dotted action name, e.g. `process.publish`, `execution.trigger`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub data_classification: DataClassification,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            details: serde_json::Value::Null,
            ip: None,
            user_agent: None,
            data_classification: DataClassification::default(),
            retention_days: default_retention_days(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_classification(mut self, classification: DataClassification) -> Self {
        self.data_classification = classification;
        self
    }

    pub fn with_request_info(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }
}

/// Query filter for listing audit entries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let entry = AuditEntry::new("alice", "process.publish", "process", "p-1")
            .with_details(serde_json::json!({"version": "1.0"}))
            .with_classification(DataClassification::Confidential);
        assert_eq!(entry.actor, "alice");
        assert_eq!(entry.action, "process.publish");
        assert_eq!(entry.data_classification, DataClassification::Confidential);
        assert_eq!(entry.retention_days, 365);
    }
}
