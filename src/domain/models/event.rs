//! Domain events emitted by the process engine.
//!
//! Events are buffered on the execution aggregate, persisted with the state
//! change that caused them, and only then published (outbox discipline).
//! Within one execution, envelope sequence numbers are strictly increasing
//! and match the order of persisted transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::{FailureInfo, SkipReason, TriggeredBy};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ProcessStarted {
        process_id: Uuid,
        process_name: String,
        triggered_by: TriggeredBy,
    },
    StepStarted {
        step_id: String,
    },
    StepCompleted {
        step_id: String,
        cost: f64,
    },
    StepFailed {
        step_id: String,
        error: FailureInfo,
    },
    StepRetrying {
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    StepSkipped {
        step_id: String,
        reason: SkipReason,
    },
    GatewayEvaluated {
        step_id: String,
        selected_routes: Vec<String>,
    },
    ApprovalRequested {
        step_id: String,
        approval_id: Uuid,
        approvers: Vec<String>,
        deadline: DateTime<Utc>,
    },
    ApprovalDecided {
        step_id: String,
        approval_id: Uuid,
        decision: String,
        decided_by: String,
    },
    ApprovalTimedOut {
        step_id: String,
        approval_id: Uuid,
    },
    ProcessCompleted {
        total_cost: f64,
        duration_ms: u64,
    },
    ProcessFailed {
        error: FailureInfo,
    },
    ProcessCancelled {
        actor: String,
        reason: String,
    },
    ExecutionRecovered {
        action: String,
    },
    ScheduleFired {
        schedule_id: Uuid,
        process_name: String,
    },
}

impl ExecutionEvent {
    /// Discriminant name, used for filtering and display.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::ProcessStarted { .. } => "ProcessStarted",
            Self::StepStarted { .. } => "StepStarted",
            Self::StepCompleted { .. } => "StepCompleted",
            Self::StepFailed { .. } => "StepFailed",
            Self::StepRetrying { .. } => "StepRetrying",
            Self::StepSkipped { .. } => "StepSkipped",
            Self::GatewayEvaluated { .. } => "GatewayEvaluated",
            Self::ApprovalRequested { .. } => "ApprovalRequested",
            Self::ApprovalDecided { .. } => "ApprovalDecided",
            Self::ApprovalTimedOut { .. } => "ApprovalTimedOut",
            Self::ProcessCompleted { .. } => "ProcessCompleted",
            Self::ProcessFailed { .. } => "ProcessFailed",
            Self::ProcessCancelled { .. } => "ProcessCancelled",
            Self::ExecutionRecovered { .. } => "ExecutionRecovered",
            Self::ScheduleFired { .. } => "ScheduleFired",
        }
    }

    /// Audit action string recorded for this event.
    pub fn audit_action(&self) -> &'static str {
        match self {
            Self::ProcessStarted { .. } => "execution.start",
            Self::StepStarted { .. } => "step.start",
            Self::StepCompleted { .. } => "step.complete",
            Self::StepFailed { .. } => "step.fail",
            Self::StepRetrying { .. } => "step.retry",
            Self::StepSkipped { .. } => "step.skip",
            Self::GatewayEvaluated { .. } => "gateway.evaluate",
            Self::ApprovalRequested { .. } => "approval.request",
            Self::ApprovalDecided { .. } => "approval.decide",
            Self::ApprovalTimedOut { .. } => "approval.timeout",
            Self::ProcessCompleted { .. } => "execution.complete",
            Self::ProcessFailed { .. } => "execution.fail",
            Self::ProcessCancelled { .. } => "execution.cancel",
            Self::ExecutionRecovered { .. } => "execution.recover",
            Self::ScheduleFired { .. } => "schedule.fire",
        }
    }

    /// The actor responsible for this event, where one exists; everything
    /// else is attributed to the engine itself.
    pub fn actor(&self) -> &str {
        match self {
            Self::ProcessStarted { triggered_by, .. } => &triggered_by.actor,
            Self::ApprovalDecided { decided_by, .. } => decided_by,
            Self::ProcessCancelled { actor, .. } => actor,
            _ => "system",
        }
    }

    /// Whether this event terminates its execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProcessCompleted { .. } | Self::ProcessFailed { .. } | Self::ProcessCancelled { .. }
        )
    }

    /// The step this event concerns, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id }
            | Self::StepCompleted { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::StepRetrying { step_id, .. }
            | Self::StepSkipped { step_id, .. }
            | Self::GatewayEvaluated { step_id, .. }
            | Self::ApprovalRequested { step_id, .. }
            | Self::ApprovalDecided { step_id, .. }
            | Self::ApprovalTimedOut { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// Envelope carrying an event with its per-execution sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,
    pub execution_id: Uuid,
    /// Strictly monotonic per execution; stamped by the aggregate.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: ExecutionEvent,
}

impl EventEnvelope {
    pub fn new(execution_id: Uuid, sequence: u64, event: ExecutionEvent) -> Self {
        Self {
            id: EventId::new(),
            execution_id,
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ErrorKind;

    #[test]
    fn test_terminal_events() {
        assert!(ExecutionEvent::ProcessCompleted { total_cost: 0.0, duration_ms: 1 }.is_terminal());
        assert!(ExecutionEvent::ProcessFailed {
            error: FailureInfo::new(ErrorKind::Timeout, "slow")
        }
        .is_terminal());
        assert!(!ExecutionEvent::StepStarted { step_id: "a".into() }.is_terminal());
    }

    #[test]
    fn test_event_serde_tagging() {
        let event = ExecutionEvent::StepCompleted { step_id: "write".into(), cost: 0.25 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_completed");
        assert_eq!(json["data"]["step_id"], "write");
        let back: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_actor_attribution() {
        let cancelled = ExecutionEvent::ProcessCancelled {
            actor: "ops@example.com".into(),
            reason: "superseded".into(),
        };
        assert_eq!(cancelled.actor(), "ops@example.com");
        assert_eq!(
            ExecutionEvent::StepStarted { step_id: "a".into() }.actor(),
            "system"
        );
    }
}
