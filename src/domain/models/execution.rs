//! Process execution aggregate.
//!
//! A `ProcessExecution` owns every step's state, the approvals raised by its
//! steps, and a buffer of pending domain events. All mutation goes through
//! aggregate methods so that invariants hold at the boundary: step completion
//! is the only way cost is added, and every transition stamps a monotonically
//! increasing sequence number onto the events it produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult, ErrorKind};
use crate::domain::models::approval::{Approval, ApprovalDecision, ApprovalStatus};
use crate::domain::models::definition::ProcessDefinition;
use crate::domain::models::event::{EventEnvelope, ExecutionEvent};

/// Status of a process execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// Waiting on at least one human approval with nothing else dispatchable.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    fn valid_transitions(&self) -> &'static [ExecutionStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Paused, Self::Completed, Self::Failed, Self::Cancelled],
            Self::Paused => &[Self::Running, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Failed but scheduled for another attempt at `not_before`.
    Retrying,
    WaitingApproval,
    WaitingTimer,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingTimer => "waiting_timer",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// States where the step has been handed off and awaits an external
    /// event rather than the resolver.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingApproval | Self::WaitingTimer)
    }

    fn valid_transitions(&self) -> &'static [StepStatus] {
        match self {
            Self::Pending => &[Self::Ready, Self::Running, Self::Skipped],
            Self::Ready => &[Self::Running, Self::Skipped, Self::Pending],
            Self::Running => &[
                Self::Completed,
                Self::Failed,
                Self::Skipped,
                Self::Retrying,
                Self::WaitingApproval,
                Self::WaitingTimer,
            ],
            Self::Retrying => &[Self::Running, Self::Skipped, Self::Failed],
            Self::WaitingApproval => &[Self::Completed, Self::Failed, Self::Skipped],
            Self::WaitingTimer => &[Self::Completed, Self::Failed, Self::Skipped],
            Self::Completed | Self::Failed | Self::Skipped => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// How an execution came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Schedule,
    Webhook,
    Agent,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
            Self::Webhook => "webhook",
            Self::Agent => "agent",
        }
    }
}

/// Provenance of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredBy {
    pub kind: TriggerKind,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,
}

impl TriggeredBy {
    pub fn manual(actor: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Manual,
            actor: actor.into(),
            schedule_id: None,
            parent_execution_id: None,
            parent_step_id: None,
        }
    }

    pub fn schedule(schedule_id: Uuid, owner: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Schedule,
            actor: owner.into(),
            schedule_id: Some(schedule_id),
            parent_execution_id: None,
            parent_step_id: None,
        }
    }

    pub fn webhook(actor: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Webhook,
            actor: actor.into(),
            schedule_id: None,
            parent_execution_id: None,
            parent_step_id: None,
        }
    }

    pub fn child_of(parent_execution_id: Uuid, parent_step_id: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Agent,
            actor: "system".to_string(),
            schedule_id: None,
            parent_execution_id: Some(parent_execution_id),
            parent_step_id: Some(parent_step_id.into()),
        }
    }
}

/// Why a step was skipped rather than dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ConditionFalse,
    UpstreamFailed,
    GatewayNotSelected,
    RetriesExhausted,
    ApprovalTimedOut,
    ExecutionFailed,
    ExecutionCancelled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConditionFalse => "condition_false",
            Self::UpstreamFailed => "upstream_failed",
            Self::GatewayNotSelected => "gateway_not_selected",
            Self::RetriesExhausted => "retries_exhausted",
            Self::ApprovalTimedOut => "approval_timed_out",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionCancelled => "execution_cancelled",
        }
    }
}

/// A classified failure carried on steps and terminal executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl From<&EngineError> for FailureInfo {
    fn from(err: &EngineError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}

/// Runtime state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Earliest instant a retrying step may be redispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    /// Route targets chosen by a completed gateway.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_routes: Vec<String>,
    /// Wall-clock resume instant for a waiting timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    /// Child execution spawned by a sub-process step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_execution_id: Option<Uuid>,
}

impl StepExecution {
    fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            not_before: None,
            output: None,
            error: None,
            skip_reason: None,
            approval_id: None,
            selected_routes: Vec::new(),
            resume_at: None,
            child_execution_id: None,
        }
    }

    /// Whether the resolver may hand this step to a handler right now.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            StepStatus::Pending => true,
            StepStatus::Retrying => self.not_before.is_none_or(|t| t <= now),
            _ => false,
        }
    }

    fn transition_to(&mut self, next: StepStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::StateConflict(format!(
                "step {}: cannot transition from {} to {}",
                self.step_id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        match next {
            StepStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }
}

/// A running (or finished) instance of a process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExecution {
    pub id: Uuid,
    pub process_id: Uuid,
    pub process_name: String,
    pub process_version: super::definition::Version,
    pub status: ExecutionStatus,
    pub triggered_by: TriggeredBy,
    pub input: serde_json::Value,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    pub steps: HashMap<String, StepExecution>,
    #[serde(default)]
    pub approvals: HashMap<Uuid, Approval>,
    pub owner_team: String,
    pub owner_user: String,
    /// Monotonic event sequence; doubles as the optimistic-concurrency
    /// version at the persistence boundary.
    pub sequence: u64,
    #[serde(skip)]
    pending_events: Vec<EventEnvelope>,
}

impl ProcessExecution {
    pub fn new(
        definition: &ProcessDefinition,
        input: serde_json::Value,
        triggered_by: TriggeredBy,
        owner_user: impl Into<String>,
    ) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepExecution::new(&s.id)))
            .collect();
        Self {
            id: Uuid::new_v4(),
            process_id: definition.id,
            process_name: definition.name.clone(),
            process_version: definition.version,
            status: ExecutionStatus::Pending,
            triggered_by,
            input,
            started_at: Utc::now(),
            completed_at: None,
            total_cost: 0.0,
            total_duration_ms: None,
            output: None,
            failure: None,
            steps,
            approvals: HashMap::new(),
            owner_team: definition.owner_team.clone(),
            owner_user: owner_user.into(),
            sequence: 0,
            pending_events: Vec::new(),
        }
    }

    fn record(&mut self, event: ExecutionEvent) {
        self.sequence += 1;
        self.pending_events
            .push(EventEnvelope::new(self.id, self.sequence, event));
    }

    /// Drain buffered events. Called only after a successful save.
    pub fn take_events(&mut self) -> Vec<EventEnvelope> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending_events.is_empty()
    }

    pub fn step(&self, step_id: &str) -> EngineResult<&StepExecution> {
        self.steps.get(step_id).ok_or_else(|| EngineError::NotFound {
            resource: "step",
            id: step_id.to_string(),
        })
    }

    fn step_mut(&mut self, step_id: &str) -> EngineResult<&mut StepExecution> {
        self.steps.get_mut(step_id).ok_or_else(|| EngineError::NotFound {
            resource: "step",
            id: step_id.to_string(),
        })
    }

    fn transition_to(&mut self, next: ExecutionStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::StateConflict(format!(
                "execution {}: cannot transition from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Pending → Running; emits `ProcessStarted`.
    pub fn begin(&mut self) -> EngineResult<()> {
        self.transition_to(ExecutionStatus::Running)?;
        self.started_at = Utc::now();
        self.record(ExecutionEvent::ProcessStarted {
            process_id: self.process_id,
            process_name: self.process_name.clone(),
            triggered_by: self.triggered_by.clone(),
        });
        Ok(())
    }

    /// Mark a dispatchable step as running; emits `StepStarted`.
    pub fn start_step(&mut self, step_id: &str) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        if step.status == StepStatus::Retrying {
            step.status = StepStatus::Running;
            step.not_before = None;
        } else {
            step.transition_to(StepStatus::Running)?;
        }
        self.record(ExecutionEvent::StepStarted { step_id: step_id.to_string() });
        Ok(())
    }

    /// Complete a step with its output. The only place cost accrues.
    pub fn complete_step(
        &mut self,
        step_id: &str,
        output: serde_json::Value,
        cost: f64,
    ) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        step.transition_to(StepStatus::Completed)?;
        step.output = Some(output);
        step.error = None;
        self.total_cost += cost;
        self.record(ExecutionEvent::StepCompleted { step_id: step_id.to_string(), cost });
        Ok(())
    }

    /// Record a terminal step failure; emits `StepFailed`.
    pub fn fail_step(&mut self, step_id: &str, failure: FailureInfo) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        step.transition_to(StepStatus::Failed)?;
        step.error = Some(failure.clone());
        self.record(ExecutionEvent::StepFailed { step_id: step_id.to_string(), error: failure });
        Ok(())
    }

    /// Schedule another attempt. `consume_attempt` is false for queue-full
    /// redispatches, which do not charge the retry budget.
    pub fn retry_step(
        &mut self,
        step_id: &str,
        failure: FailureInfo,
        not_before: DateTime<Utc>,
        max_attempts: u32,
        consume_attempt: bool,
    ) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        step.transition_to(StepStatus::Retrying)?;
        if consume_attempt {
            step.retry_count += 1;
        }
        step.not_before = Some(not_before);
        step.error = Some(failure);
        let attempt = step.retry_count;
        let delay_ms = (not_before - Utc::now()).num_milliseconds().max(0) as u64;
        self.record(ExecutionEvent::StepRetrying {
            step_id: step_id.to_string(),
            attempt,
            max_attempts,
            delay_ms,
        });
        Ok(())
    }

    /// Skip a step; emits `StepSkipped`.
    pub fn skip_step(&mut self, step_id: &str, reason: SkipReason) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        step.transition_to(StepStatus::Skipped)?;
        step.skip_reason = Some(reason);
        self.record(ExecutionEvent::StepSkipped { step_id: step_id.to_string(), reason });
        Ok(())
    }

    /// Store a gateway's route selection and complete it.
    pub fn complete_gateway(&mut self, step_id: &str, selected: Vec<String>) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        step.transition_to(StepStatus::Completed)?;
        step.selected_routes = selected.clone();
        step.output = Some(serde_json::json!({ "selected_routes": selected }));
        self.record(ExecutionEvent::GatewayEvaluated {
            step_id: step_id.to_string(),
            selected_routes: selected,
        });
        Ok(())
    }

    /// Suspend a step on a freshly created approval; emits
    /// `ApprovalRequested`.
    pub fn wait_for_approval(&mut self, step_id: &str, approval: Approval) -> EngineResult<()> {
        let approval_id = approval.id;
        let approvers = approval.approvers.clone();
        let deadline = approval.deadline;
        let step = self.step_mut(step_id)?;
        step.transition_to(StepStatus::WaitingApproval)?;
        step.approval_id = Some(approval_id);
        self.approvals.insert(approval_id, approval);
        self.record(ExecutionEvent::ApprovalRequested {
            step_id: step_id.to_string(),
            approval_id,
            approvers,
            deadline,
        });
        Ok(())
    }

    /// Suspend a step until a wall-clock instant. No event: suspension is
    /// not a terminal transition.
    pub fn wait_for_timer(&mut self, step_id: &str, resume_at: DateTime<Utc>) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        step.transition_to(StepStatus::WaitingTimer)?;
        step.resume_at = Some(resume_at);
        Ok(())
    }

    /// Tie a running sub-process step to its child execution.
    pub fn wait_for_child(&mut self, step_id: &str, child_id: Uuid) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        if step.status != StepStatus::Running {
            return Err(EngineError::StateConflict(format!(
                "step {}: cannot attach child while {}",
                step_id,
                step.status.as_str()
            )));
        }
        step.child_execution_id = Some(child_id);
        Ok(())
    }

    pub fn approval(&self, approval_id: Uuid) -> EngineResult<&Approval> {
        self.approvals.get(&approval_id).ok_or(EngineError::NotFound {
            resource: "approval",
            id: approval_id.to_string(),
        })
    }

    /// Apply a human decision to an approval; emits `ApprovalDecided`.
    /// Returns the owning step id. The caller decides how the step resumes.
    pub fn decide_approval(
        &mut self,
        approval_id: Uuid,
        decision: ApprovalDecision,
        decided_by: &str,
        comment: Option<String>,
    ) -> EngineResult<String> {
        let approval = self.approvals.get_mut(&approval_id).ok_or(EngineError::NotFound {
            resource: "approval",
            id: approval_id.to_string(),
        })?;
        approval.decide(decision, decided_by, comment)?;
        let step_id = approval.step_id.clone();
        let decided = approval.status.as_str().to_string();
        self.record(ExecutionEvent::ApprovalDecided {
            step_id: step_id.clone(),
            approval_id,
            decision: decided,
            decided_by: decided_by.to_string(),
        });
        Ok(step_id)
    }

    /// Expire a pending approval; emits `ApprovalTimedOut`. Returns the
    /// owning step id.
    pub fn timeout_approval(&mut self, approval_id: Uuid) -> EngineResult<String> {
        let approval = self.approvals.get_mut(&approval_id).ok_or(EngineError::NotFound {
            resource: "approval",
            id: approval_id.to_string(),
        })?;
        approval.time_out()?;
        let step_id = approval.step_id.clone();
        self.record(ExecutionEvent::ApprovalTimedOut { step_id: step_id.clone(), approval_id });
        Ok(step_id)
    }

    /// Running → Paused (quiesced on approvals).
    pub fn pause(&mut self) -> EngineResult<()> {
        self.transition_to(ExecutionStatus::Paused)
    }

    /// Paused → Running (a decision arrived).
    pub fn resume_running(&mut self) -> EngineResult<()> {
        self.transition_to(ExecutionStatus::Running)
    }

    /// Finish successfully. Requires every step to be terminal.
    pub fn complete(&mut self, output: Option<serde_json::Value>) -> EngineResult<()> {
        if let Some(open) = self.steps.values().find(|s| !s.status.is_terminal()) {
            return Err(EngineError::StateConflict(format!(
                "cannot complete execution {}: step {} is {}",
                self.id,
                open.step_id,
                open.status.as_str()
            )));
        }
        self.transition_to(ExecutionStatus::Completed)?;
        let now = Utc::now();
        self.completed_at = Some(now);
        let duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.total_duration_ms = Some(duration_ms);
        self.output = output;
        self.record(ExecutionEvent::ProcessCompleted { total_cost: self.total_cost, duration_ms });
        Ok(())
    }

    /// Fail the execution, skipping every step still eligible to run.
    pub fn fail(&mut self, failure: FailureInfo) -> EngineResult<()> {
        self.transition_to(ExecutionStatus::Failed)?;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.total_duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.failure = Some(failure.clone());
        let leftover: Vec<String> = self
            .steps
            .values()
            .filter(|s| !s.status.is_terminal() && s.status != StepStatus::Running)
            .map(|s| s.step_id.clone())
            .collect();
        for step_id in leftover {
            let step = self.steps.get_mut(&step_id).unwrap_or_else(|| unreachable!());
            step.status = StepStatus::Skipped;
            step.skip_reason = Some(SkipReason::ExecutionFailed);
            step.completed_at = Some(now);
            self.record(ExecutionEvent::StepSkipped {
                step_id,
                reason: SkipReason::ExecutionFailed,
            });
        }
        self.record(ExecutionEvent::ProcessFailed { error: failure });
        Ok(())
    }

    /// Cancel the execution; running steps are failed with `Cancelled`,
    /// everything else still open is skipped.
    pub fn cancel(&mut self, actor: &str, reason: &str) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::StateConflict(format!(
                "execution {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = ExecutionStatus::Cancelled;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.total_duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        let open: Vec<(String, StepStatus)> = self
            .steps
            .values()
            .filter(|s| !s.status.is_terminal())
            .map(|s| (s.step_id.clone(), s.status))
            .collect();
        for (step_id, status) in open {
            let step = self.steps.get_mut(&step_id).unwrap_or_else(|| unreachable!());
            step.completed_at = Some(now);
            if status == StepStatus::Running {
                step.status = StepStatus::Failed;
                step.error = Some(FailureInfo::new(ErrorKind::Cancelled, reason));
            } else {
                step.status = StepStatus::Skipped;
                step.skip_reason = Some(SkipReason::ExecutionCancelled);
            }
        }
        self.record(ExecutionEvent::ProcessCancelled {
            actor: actor.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Recovery escape hatch: reset an interrupted running step back to
    /// pending, bypassing the step state machine. Logged loudly so bypass
    /// sites stay visible.
    pub fn reset_step_for_recovery(&mut self, step_id: &str, bump_retry: bool) -> EngineResult<()> {
        let step = self.step_mut(step_id)?;
        tracing::warn!(
            step_id = %step.step_id,
            from = %step.status.as_str(),
            "resetting interrupted step to pending for recovery"
        );
        step.status = StepStatus::Pending;
        step.started_at = None;
        step.approval_id = None;
        step.resume_at = None;
        if bump_retry {
            step.retry_count += 1;
        }
        Ok(())
    }

    /// Record that recovery acted on this execution.
    pub fn mark_recovered(&mut self, action: &str) {
        self.record(ExecutionEvent::ExecutionRecovered { action: action.to_string() });
    }

    /// Steps currently handed off (running or waiting on approval/timer).
    pub fn waiting_steps(&self) -> Vec<&StepExecution> {
        self.steps.values().filter(|s| s.status.is_waiting()).collect()
    }

    /// Whether every step has reached a terminal status.
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.values().all(|s| s.status.is_terminal())
    }

    /// Whether any step failed.
    pub fn any_step_failed(&self) -> bool {
        self.steps.values().any(|s| s.status == StepStatus::Failed)
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_hours()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::definition::{OnError, ProcessDefinition, StepConfig, StepDefinition};

    fn two_step_definition() -> ProcessDefinition {
        let mut def = ProcessDefinition::new_draft("pipeline", "platform", "alice");
        def.steps = vec![
            StepDefinition {
                id: "a".into(),
                name: "a".into(),
                depends_on: vec![],
                condition: None,
                informed_agents: vec![],
                config: StepConfig::AgentTask {
                    agent: "worker".into(),
                    message: "m".into(),
                    timeout_secs: 60,
                    max_cost: None,
                    retry: None,
                    on_error: OnError::Fail,
                },
            },
            StepDefinition {
                id: "b".into(),
                name: "b".into(),
                depends_on: vec!["a".into()],
                condition: None,
                informed_agents: vec![],
                config: StepConfig::AgentTask {
                    agent: "worker".into(),
                    message: "m".into(),
                    timeout_secs: 60,
                    max_cost: None,
                    retry: None,
                    on_error: OnError::Fail,
                },
            },
        ];
        def.publish().unwrap();
        def
    }

    fn new_execution() -> ProcessExecution {
        let def = two_step_definition();
        ProcessExecution::new(
            &def,
            serde_json::json!({"topic": "T"}),
            TriggeredBy::manual("alice"),
            "alice",
        )
    }

    #[test]
    fn test_sequence_is_monotonic_and_matches_transition_order() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        exec.complete_step("a", serde_json::json!("out"), 0.5).unwrap();
        let events = exec.take_events();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(events[0].event.variant_name(), "ProcessStarted");
        assert_eq!(events[1].event.variant_name(), "StepStarted");
        assert_eq!(events[2].event.variant_name(), "StepCompleted");
        assert!(!exec.has_pending_events());
    }

    #[test]
    fn test_cost_accrues_only_through_completion() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        exec.complete_step("a", serde_json::json!("out"), 0.25).unwrap();
        exec.start_step("b").unwrap();
        exec.complete_step("b", serde_json::json!("out"), 0.75).unwrap();
        assert!((exec.total_cost - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_complete_requires_all_steps_terminal() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        exec.complete_step("a", serde_json::json!("out"), 0.0).unwrap();
        assert!(exec.complete(None).is_err());
        exec.start_step("b").unwrap();
        exec.complete_step("b", serde_json::json!("out"), 0.0).unwrap();
        exec.complete(Some(serde_json::json!("done"))).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.total_duration_ms.is_some());
    }

    #[test]
    fn test_fail_skips_open_steps() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        exec.fail_step("a", FailureInfo::new(ErrorKind::Timeout, "slow")).unwrap();
        exec.fail(FailureInfo::new(ErrorKind::Timeout, "slow")).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        let b = exec.step("b").unwrap();
        assert_eq!(b.status, StepStatus::Skipped);
        assert_eq!(b.skip_reason, Some(SkipReason::ExecutionFailed));
        let last = exec.take_events().pop().unwrap();
        assert_eq!(last.event.variant_name(), "ProcessFailed");
    }

    #[test]
    fn test_cancel_marks_running_failed_and_rest_skipped() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        exec.cancel("ops", "superseded").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert_eq!(exec.step("a").unwrap().status, StepStatus::Failed);
        assert_eq!(
            exec.step("a").unwrap().error.as_ref().unwrap().kind,
            ErrorKind::Cancelled
        );
        assert_eq!(exec.step("b").unwrap().status, StepStatus::Skipped);
        assert!(exec.cancel("ops", "again").is_err());
    }

    #[test]
    fn test_retry_step_bookkeeping() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        exec.retry_step("a", FailureInfo::new(ErrorKind::Timeout, "slow"), later, 3, true)
            .unwrap();
        let a = exec.step("a").unwrap();
        assert_eq!(a.status, StepStatus::Retrying);
        assert_eq!(a.retry_count, 1);
        assert!(!a.is_dispatchable(Utc::now()));
        assert!(a.is_dispatchable(later + chrono::Duration::seconds(1)));

        // Queue-full redispatch does not consume an attempt
        exec.start_step("a").unwrap();
        exec.retry_step("a", FailureInfo::new(ErrorKind::QueueFull, "full"), later, 3, false)
            .unwrap();
        assert_eq!(exec.step("a").unwrap().retry_count, 1);
    }

    #[test]
    fn test_approval_lifecycle_on_aggregate() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        let approval = Approval::new(
            exec.id,
            "a",
            vec!["alice".into()],
            Utc::now() + chrono::Duration::hours(1),
        );
        let approval_id = approval.id;
        exec.wait_for_approval("a", approval).unwrap();
        assert_eq!(exec.step("a").unwrap().status, StepStatus::WaitingApproval);

        let step_id = exec
            .decide_approval(approval_id, ApprovalDecision::Approve, "alice", None)
            .unwrap();
        assert_eq!(step_id, "a");
        assert_eq!(exec.approval(approval_id).unwrap().status, ApprovalStatus::Approved);

        // Deciding twice is a conflict
        assert!(exec
            .decide_approval(approval_id, ApprovalDecision::Reject, "alice", None)
            .is_err());
    }

    #[test]
    fn test_invalid_step_transition_is_conflict() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        // Completing a step that never started
        let err = exec.complete_step("a", serde_json::json!({}), 0.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn test_reset_step_for_recovery() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        exec.reset_step_for_recovery("a", true).unwrap();
        let a = exec.step("a").unwrap();
        assert_eq!(a.status, StepStatus::Pending);
        assert_eq!(a.retry_count, 1);
        assert!(a.started_at.is_none());
    }

    #[test]
    fn test_save_load_round_trip_modulo_pending_events() {
        let mut exec = new_execution();
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        let json = serde_json::to_string(&exec).unwrap();
        let loaded: ProcessExecution = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.id, exec.id);
        assert_eq!(loaded.sequence, exec.sequence);
        assert_eq!(loaded.steps, exec.steps);
        assert!(!loaded.has_pending_events());
    }
}
