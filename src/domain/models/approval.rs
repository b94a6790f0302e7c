//! Human approval records.
//!
//! An approval is attached to a `human_approval` step and lives inside the
//! owning execution aggregate; a decision (or its deadline) resumes the step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    ChangesRequested,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ChangesRequested => "changes_requested",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A decision submitted by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
    RequestChanges,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestChanges => "request_changes",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approve),
            "reject" | "rejected" => Some(Self::Reject),
            "request_changes" | "changes_requested" => Some(Self::RequestChanges),
            _ => None,
        }
    }

    fn status(self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Approved,
            Self::Reject => ApprovalStatus::Rejected,
            Self::RequestChanges => ApprovalStatus::ChangesRequested,
        }
    }
}

/// A pending or decided human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub approvers: Vec<String>,
    pub deadline: DateTime<Utc>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    pub fn new(
        execution_id: Uuid,
        step_id: impl Into<String>,
        approvers: Vec<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id: step_id.into(),
            approvers,
            deadline,
            status: ApprovalStatus::Pending,
            title: None,
            artifacts: Vec::new(),
            decided_by: None,
            comment: None,
            decision_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the given identity may decide this approval.
    pub fn is_approver(&self, user_id: &str) -> bool {
        self.approvers.iter().any(|a| a == user_id)
    }

    /// Record a decision. Fails if the approval is no longer pending.
    pub fn decide(
        &mut self,
        decision: ApprovalDecision,
        decided_by: impl Into<String>,
        comment: Option<String>,
    ) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::StateConflict(format!(
                "approval {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = decision.status();
        self.decided_by = Some(decided_by.into());
        self.comment = comment;
        self.decision_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the approval as expired without a decision.
    pub fn time_out(&mut self) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::StateConflict(format!(
                "approval {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = ApprovalStatus::TimedOut;
        self.decision_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Approval {
        Approval::new(
            Uuid::new_v4(),
            "review",
            vec!["alice@example.com".to_string()],
            Utc::now() + chrono::Duration::hours(1),
        )
    }

    #[test]
    fn test_decide_approve() {
        let mut approval = pending();
        approval
            .decide(ApprovalDecision::Approve, "alice@example.com", Some("lgtm".into()))
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert_eq!(approval.decided_by.as_deref(), Some("alice@example.com"));
        assert!(approval.decision_at.is_some());
    }

    #[test]
    fn test_double_decision_rejected() {
        let mut approval = pending();
        approval.decide(ApprovalDecision::Reject, "alice@example.com", None).unwrap();
        assert!(approval.decide(ApprovalDecision::Approve, "alice@example.com", None).is_err());
    }

    #[test]
    fn test_timeout_only_when_pending() {
        let mut approval = pending();
        approval.time_out().unwrap();
        assert_eq!(approval.status, ApprovalStatus::TimedOut);
        assert!(approval.time_out().is_err());
    }

    #[test]
    fn test_is_approver() {
        let approval = pending();
        assert!(approval.is_approver("alice@example.com"));
        assert!(!approval.is_approver("mallory@example.com"));
    }

    #[test]
    fn test_decision_parse() {
        assert_eq!(ApprovalDecision::from_str("approve"), Some(ApprovalDecision::Approve));
        assert_eq!(ApprovalDecision::from_str("REJECTED"), Some(ApprovalDecision::Reject));
        assert_eq!(ApprovalDecision::from_str("maybe"), None);
    }
}
