//! Step handlers: one per step kind.
//!
//! A handler never mutates the execution. It inspects a snapshot, does its
//! I/O, and reports a [`DispatchOutcome`]; the coordinator owns every state
//! transition. Control flow is data, not unwinding: retries and suspensions
//! are outcome variants the engine switches over.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::sync::watch;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{
    Approval, FailureInfo, ProcessDefinition, ProcessExecution, StepDefinition, StepKind, Version,
};

pub mod agent_task;
pub mod gateway;
pub mod human_approval;
pub mod notification;
pub mod sub_process;
pub mod timer;

pub use agent_task::AgentTaskHandler;
pub use gateway::GatewayHandler;
pub use human_approval::HumanApprovalHandler;
pub use notification::NotificationHandler;
pub use sub_process::SubProcessHandler;
pub use timer::TimerHandler;

/// Why a handler suspended instead of finishing.
#[derive(Debug, Clone)]
pub enum SuspendReason {
    /// A human decision is required; the approval record to raise.
    Approval(Approval),
    /// Wake at the given wall-clock instant.
    Timer { resume_at: DateTime<Utc> },
    /// A child execution must run; the coordinator triggers it.
    Child {
        process: String,
        version: Option<Version>,
        input: Json,
    },
}

/// Result of dispatching a step.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Completed { output: Json, cost: f64 },
    Failed(FailureInfo),
    Suspended(SuspendReason),
    Routed(Vec<String>),
}

/// Everything a handler may look at: immutable snapshots plus the
/// execution-level cancellation signal.
pub struct StepContext {
    pub definition: Arc<ProcessDefinition>,
    pub execution: ProcessExecution,
    pub step_id: String,
    /// Expression context (`input.*`, `steps.*`, `now`).
    pub expr_ctx: Json,
    pub cancel: watch::Receiver<bool>,
}

impl StepContext {
    pub fn step(&self) -> EngineResult<&StepDefinition> {
        self.definition
            .step(&self.step_id)
            .ok_or_else(|| EngineError::NotFound { resource: "step", id: self.step_id.clone() })
    }
}

/// A handler for one step kind.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn dispatch(&self, ctx: &StepContext) -> EngineResult<DispatchOutcome>;
}

/// The full handler set, dispatched by step kind.
pub struct StepHandlers {
    agent_task: AgentTaskHandler,
    gateway: GatewayHandler,
    human_approval: HumanApprovalHandler,
    timer: TimerHandler,
    notification: NotificationHandler,
    sub_process: SubProcessHandler,
}

impl StepHandlers {
    pub fn new(
        queue: Arc<crate::services::agent_queue::AgentExecutionQueue>,
        notifications: Arc<dyn crate::domain::ports::NotificationSink>,
    ) -> Self {
        Self {
            agent_task: AgentTaskHandler::new(queue),
            gateway: GatewayHandler::new(),
            human_approval: HumanApprovalHandler::new(),
            timer: TimerHandler::new(),
            notification: NotificationHandler::new(notifications),
            sub_process: SubProcessHandler::new(),
        }
    }

    /// Route the dispatch to the handler for the step's kind.
    pub async fn dispatch(&self, ctx: &StepContext) -> EngineResult<DispatchOutcome> {
        let kind = ctx.step()?.kind();
        match kind {
            StepKind::AgentTask => self.agent_task.dispatch(ctx).await,
            StepKind::Gateway => self.gateway.dispatch(ctx).await,
            StepKind::HumanApproval => self.human_approval.dispatch(ctx).await,
            StepKind::Timer => self.timer.dispatch(ctx).await,
            StepKind::Notification => self.notification.dispatch(ctx).await,
            StepKind::SubProcess => self.sub_process.dispatch(ctx).await,
        }
    }
}
