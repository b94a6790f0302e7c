//! Domain models.

pub mod approval;
pub mod audit;
pub mod definition;
pub mod event;
pub mod execution;
pub mod identity;
pub mod schedule;

pub use approval::{Approval, ApprovalDecision, ApprovalStatus};
pub use audit::{AuditEntry, AuditFilter};
pub use definition::{
    Backoff, DataClassification, DefinitionStatus, GatewayRoute, GatewayType, OnError,
    OutputConfig, ProcessDefinition, QueuePriority, RetryPolicy, StepConfig, StepDefinition,
    StepKind, TimeoutAction, TimerWait, TriggerSpec, Version,
};
pub use event::{EventEnvelope, EventId, ExecutionEvent};
pub use execution::{
    ExecutionStatus, FailureInfo, ProcessExecution, SkipReason, StepExecution, StepStatus,
    TriggerKind, TriggeredBy,
};
pub use identity::{CallerIdentity, Permission, Role};
pub use schedule::Schedule;
