//! Execution engine: the coordinator driving one execution's state machine.
//!
//! Exactly one coordinator operation mutates an execution at a time,
//! serialized by a per-execution lock. Handlers run outside the lock against
//! snapshots; their outcomes are applied under it. Every transition persists
//! before its events publish (outbox), and completions are processed in
//! arrival order.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult, ErrorKind};
use crate::domain::models::{
    ApprovalDecision, DefinitionStatus, ExecutionStatus, FailureInfo, OnError, ProcessDefinition,
    ProcessExecution, SkipReason, StepConfig, StepStatus, TimeoutAction, TriggeredBy, Version,
};
use crate::domain::ports::{OutputStore, ProcessDefinitionRepository, ProcessExecutionRepository};
use crate::services::dependency_resolver::DependencyResolver;
use crate::services::event_bus::EventBus;
use crate::services::expression::{execution_context, ExpressionEvaluator};
use crate::services::handlers::{DispatchOutcome, StepContext, StepHandlers, SuspendReason};
use crate::services::limits::ExecutionLimitService;

/// Short fixed delay for queue-full redispatches; these do not consume a
/// retry attempt.
const QUEUE_FULL_REDISPATCH_MS: i64 = 1_000;

/// The coordinator.
pub struct ExecutionEngine {
    definitions: Arc<dyn ProcessDefinitionRepository>,
    executions: Arc<dyn ProcessExecutionRepository>,
    outputs: Arc<dyn OutputStore>,
    handlers: StepHandlers,
    bus: Arc<EventBus>,
    resolver: DependencyResolver,
    evaluator: ExpressionEvaluator,
    limits: Arc<ExecutionLimitService>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    cancel_signals: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl ExecutionEngine {
    pub fn new(
        definitions: Arc<dyn ProcessDefinitionRepository>,
        executions: Arc<dyn ProcessExecutionRepository>,
        outputs: Arc<dyn OutputStore>,
        handlers: StepHandlers,
        bus: Arc<EventBus>,
        limits: Arc<ExecutionLimitService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            definitions,
            executions,
            outputs,
            handlers,
            bus,
            resolver: DependencyResolver::new(),
            evaluator: ExpressionEvaluator::new(),
            limits,
            locks: Mutex::new(HashMap::new()),
            cancel_signals: Mutex::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    async fn lock_for(&self, execution_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(execution_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn cancel_receiver(&self, execution_id: Uuid) -> watch::Receiver<bool> {
        let mut signals = self.cancel_signals.lock().await;
        signals
            .entry(execution_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    async fn cleanup(&self, execution_id: Uuid) {
        self.locks.lock().await.remove(&execution_id);
        self.cancel_signals.lock().await.remove(&execution_id);
    }

    /// Persist, then publish the drained events. Outbox order.
    async fn persist_and_publish(&self, execution: &mut ProcessExecution) -> EngineResult<()> {
        self.executions.save(execution).await?;
        self.bus.publish_all(execution.take_events());
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> EngineResult<ProcessExecution> {
        self.executions.get(execution_id).await?.ok_or(EngineError::NotFound {
            resource: "execution",
            id: execution_id.to_string(),
        })
    }

    async fn load_definition(&self, process_id: Uuid) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions
            .get(process_id)
            .await?
            .map(Arc::new)
            .ok_or(EngineError::NotFound { resource: "process", id: process_id.to_string() })
    }

    /// Start a new execution of the named process and return its id. The
    /// engine loop runs in the background.
    ///
    /// Returns a boxed future (rather than `async fn`) because this method
    /// recurses indirectly through `advance` -> `apply_suspension`, which
    /// makes the compiler unable to resolve the opaque future's `Send`-ness
    /// otherwise.
    pub fn start<'a>(
        self: Arc<Self>,
        process_name: &'a str,
        version: Option<Version>,
        input: Json,
        triggered_by: TriggeredBy,
        owner_user: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = EngineResult<Uuid>> + Send + 'a>>
    {
        Box::pin(async move {
            let definition = match version {
                Some(v) => self.definitions.get_by_name(process_name, Some(v)).await?,
                None => self.definitions.latest_published(process_name).await?,
            }
            .ok_or(EngineError::NotFound {
                resource: "process",
                id: process_name.to_string(),
            })?;

            if definition.status != DefinitionStatus::Published {
                return Err(EngineError::StateConflict(format!(
                    "process {} v{} is {}, not published",
                    definition.name,
                    definition.version,
                    definition.status.as_str()
                )));
            }

            self.limits.check_can_start(&definition).await?;

            let execution = ProcessExecution::new(&definition, input, triggered_by, owner_user);
            let execution_id = execution.id;
            self.executions.save(&execution).await?;
            info!(execution_id = %execution_id, process = %definition.name, "execution created");

            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.advance(execution_id).await {
                    error!(execution_id = %execution_id, error = %e, "engine loop failed");
                }
            });
            Ok(execution_id)
        })
    }

    /// Advance the execution as far as it will go: apply skips to fixpoint,
    /// dispatch every ready step, or settle a terminal/paused state.
    ///
    /// Returns a boxed future (rather than `async fn`) because this method
    /// recurses indirectly through `apply_outcome`, which makes the
    /// compiler unable to resolve the opaque future's `Send`-ness otherwise.
    pub fn advance(
        self: Arc<Self>,
        execution_id: Uuid,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = EngineResult<()>> + Send>> {
        Box::pin(async move { self.advance_inner(execution_id).await })
    }

    async fn advance_inner(self: Arc<Self>, execution_id: Uuid) -> EngineResult<()> {
        let lock = self.lock_for(execution_id).await;
        let guard = lock.lock().await;

        let mut execution = self.load_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(());
        }
        let definition = self.load_definition(execution.process_id).await?;

        if execution.status == ExecutionStatus::Pending {
            execution.begin()?;
            self.persist_and_publish(&mut execution).await?;
        }
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }

        // Apply skips until none remain, then collect the ready set.
        let now = Utc::now();
        let ready = loop {
            let readiness = self.resolver.resolve(&definition, &execution, now)?;
            if readiness.skip.is_empty() {
                break readiness.ready;
            }
            for (step_id, reason) in readiness.skip {
                execution.skip_step(&step_id, reason)?;
            }
            self.persist_and_publish(&mut execution).await?;
        };

        if ready.is_empty() {
            return self.settle(&definition, &mut execution).await;
        }

        // Mark every ready step running in definition order, persist, then
        // dispatch them in parallel against a shared snapshot.
        for step_id in &ready {
            execution.start_step(step_id)?;
        }
        self.persist_and_publish(&mut execution).await?;

        let snapshot = execution.clone();
        let expr_ctx = execution_context(&snapshot);
        drop(guard);

        for step_id in ready {
            let engine = self.clone();
            let ctx = StepContext {
                definition: definition.clone(),
                execution: snapshot.clone(),
                step_id: step_id.clone(),
                expr_ctx: expr_ctx.clone(),
                cancel: self.cancel_receiver(execution_id).await,
            };
            tokio::spawn(async move {
                let outcome = engine.handlers.dispatch(&ctx).await;
                if let Err(e) =
                    engine.clone().apply_outcome(execution_id, &step_id, outcome).await
                {
                    error!(
                        execution_id = %execution_id,
                        step = %step_id,
                        error = %e,
                        "failed to apply step outcome"
                    );
                }
            });
        }
        Ok(())
    }

    /// No step is dispatchable: complete, fail, pause, or keep waiting.
    async fn settle(
        &self,
        definition: &ProcessDefinition,
        execution: &mut ProcessExecution,
    ) -> EngineResult<()> {
        if execution.all_steps_terminal() {
            if execution.any_step_failed() {
                let failure = execution
                    .steps
                    .values()
                    .find_map(|s| s.error.clone())
                    .unwrap_or_else(|| {
                        FailureInfo::new(ErrorKind::Internal, "step failed without detail")
                    });
                execution.fail(failure)?;
            } else {
                let output = self.final_output(definition, execution)?;
                execution.complete(output)?;
            }
            self.persist_and_publish(execution).await?;
            self.cleanup(execution.id).await;
            return Ok(());
        }

        // Not terminal: something is in flight or waiting. Pause only when
        // approvals are the sole thing left to wait for.
        let statuses: Vec<StepStatus> = execution.steps.values().map(|s| s.status).collect();
        let any_live = statuses.iter().any(|s| {
            matches!(s, StepStatus::Running | StepStatus::WaitingTimer | StepStatus::Retrying)
        });
        let any_approval = statuses.iter().any(|s| *s == StepStatus::WaitingApproval);
        if any_approval && !any_live {
            execution.pause()?;
        }
        if execution.has_pending_events() || execution.status == ExecutionStatus::Paused {
            self.persist_and_publish(execution).await?;
        }
        Ok(())
    }

    /// Final output: the definition's output template when present,
    /// otherwise the content of the last completed step in definition order.
    fn final_output(
        &self,
        definition: &ProcessDefinition,
        execution: &ProcessExecution,
    ) -> EngineResult<Option<Json>> {
        if let Some(config) = &definition.output {
            let ctx = execution_context(execution);
            let rendered = self.evaluator.render(&config.template, &ctx)?;
            return Ok(Some(Json::String(rendered)));
        }
        let last = definition
            .steps
            .iter()
            .rev()
            .filter_map(|s| execution.steps.get(&s.id))
            .find(|s| s.status == StepStatus::Completed && s.output.is_some());
        Ok(last.and_then(|s| {
            s.output.as_ref().map(|o| match o.get("content") {
                Some(content) => content.clone(),
                None => o.clone(),
            })
        }))
    }

    /// Apply a handler outcome under the execution lock. Late outcomes for
    /// terminal executions are discarded.
    #[instrument(skip(self, outcome), fields(execution_id = %execution_id, step = %step_id))]
    async fn apply_outcome(
        self: Arc<Self>,
        execution_id: Uuid,
        step_id: &str,
        outcome: EngineResult<DispatchOutcome>,
    ) -> EngineResult<()> {
        let lock = self.lock_for(execution_id).await;
        let guard = lock.lock().await;

        let mut execution = self.load_execution(execution_id).await?;
        if execution.status.is_terminal() {
            debug!("discarding outcome for terminal execution");
            return Ok(());
        }
        if execution.step(step_id)?.status != StepStatus::Running {
            debug!("discarding outcome for step no longer running");
            return Ok(());
        }
        let definition = self.load_definition(execution.process_id).await?;
        let step_def = definition
            .step(step_id)
            .ok_or_else(|| EngineError::NotFound { resource: "step", id: step_id.to_string() })?;

        match outcome {
            Ok(DispatchOutcome::Completed { output, cost }) => {
                self.outputs.store(execution_id, step_id, &output).await?;
                execution.complete_step(step_id, output, cost)?;
                if let Some(cap) = definition.max_cost {
                    if execution.total_cost > cap {
                        execution.fail(FailureInfo::new(
                            ErrorKind::BudgetExceeded,
                            format!(
                                "execution cost {:.4} exceeded process cap {cap:.4}",
                                execution.total_cost
                            ),
                        ))?;
                    }
                }
            }
            Ok(DispatchOutcome::Routed(targets)) => {
                execution.complete_gateway(step_id, targets)?;
            }
            Ok(DispatchOutcome::Suspended(reason)) => {
                self.clone()
                    .apply_suspension(&mut execution, step_id, reason)
                    .await?;
            }
            Ok(DispatchOutcome::Failed(failure)) => {
                self.clone().handle_failure(&mut execution, step_def, failure)?;
            }
            Err(err) => {
                let failure = FailureInfo::from(&err);
                self.clone().handle_failure(&mut execution, step_def, failure)?;
            }
        }

        self.persist_and_publish(&mut execution).await?;
        let status = execution.status;
        drop(guard);

        if status.is_terminal() {
            self.cleanup(execution_id).await;
        } else if status == ExecutionStatus::Running {
            self.advance(execution_id).await?;
        }
        Ok(())
    }

    async fn apply_suspension(
        self: Arc<Self>,
        execution: &mut ProcessExecution,
        step_id: &str,
        reason: SuspendReason,
    ) -> EngineResult<()> {
        match reason {
            SuspendReason::Approval(approval) => {
                let approval_id = approval.id;
                let deadline = approval.deadline;
                execution.wait_for_approval(step_id, approval)?;
                self.arm_approval_deadline(execution.id, approval_id, deadline);
            }
            SuspendReason::Timer { resume_at } => {
                execution.wait_for_timer(step_id, resume_at)?;
                self.arm_wake(execution.id, step_id.to_string(), resume_at);
            }
            SuspendReason::Child { process, version, input } => {
                let triggered_by = TriggeredBy::child_of(execution.id, step_id);
                let owner = execution.owner_user.clone();
                match self
                    .clone()
                    .start(&process, version, input, triggered_by, &owner)
                    .await
                {
                    Ok(child_id) => {
                        execution.wait_for_child(step_id, child_id)?;
                        debug!(child = %child_id, step = %step_id, "child execution started");
                    }
                    Err(err) => {
                        let definition = self.load_definition(execution.process_id).await?;
                        let step_def = definition.step(step_id).ok_or_else(|| {
                            EngineError::NotFound { resource: "step", id: step_id.to_string() }
                        })?;
                        self.clone()
                            .handle_failure(execution, step_def, FailureInfo::from(&err))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Retry-policy switch for a failed dispatch. Never unwinds: every
    /// branch is an explicit state transition.
    fn handle_failure(
        self: Arc<Self>,
        execution: &mut ProcessExecution,
        step_def: &crate::domain::models::StepDefinition,
        failure: FailureInfo,
    ) -> EngineResult<()> {
        let step_id = step_def.id.clone();
        let retry = step_def.config.retry_policy().cloned().unwrap_or_default();
        let now = Utc::now();

        // Queue overflow redispatches after a short fixed delay without
        // consuming an attempt, unless explicitly non-retryable.
        if failure.kind == ErrorKind::QueueFull
            && !retry.non_retryable_kinds.contains(&ErrorKind::QueueFull)
        {
            let not_before = now + chrono::Duration::milliseconds(QUEUE_FULL_REDISPATCH_MS);
            execution.retry_step(&step_id, failure, not_before, retry.max_attempts, false)?;
            self.arm_wake(execution.id, step_id, not_before);
            return Ok(());
        }

        let attempts_used = execution.step(&step_id)?.retry_count + 1;
        if !failure.kind.is_fatal_for_execution() && retry.should_retry(failure.kind, attempts_used)
        {
            let delay = retry.delay_for(attempts_used);
            let not_before = now + chrono::Duration::from_std(delay).unwrap_or_default();
            execution.retry_step(&step_id, failure, not_before, retry.max_attempts, true)?;
            self.arm_wake(execution.id, step_id, not_before);
            return Ok(());
        }

        // Exhausted or non-retryable.
        if step_def.config.on_error() == OnError::SkipStep && !failure.kind.is_fatal_for_execution()
        {
            warn!(step = %step_id, kind = %failure.kind, "step failed, skipping per policy");
            execution.skip_step(&step_id, SkipReason::RetriesExhausted)?;
            return Ok(());
        }

        execution.fail_step(&step_id, failure.clone())?;
        execution.fail(failure)?;
        Ok(())
    }

    /// Arm a wall-clock wake for a retrying or timer-waiting step.
    fn arm_wake(self: Arc<Self>, execution_id: Uuid, step_id: String, at: DateTime<Utc>) {
        tokio::spawn(async move {
            sleep_until(at).await;
            if let Err(e) = self.wake_step(execution_id, &step_id).await {
                warn!(execution_id = %execution_id, step = %step_id, error = %e, "wake failed");
            }
        });
    }

    /// Timer fired: complete a waiting timer step, or let the resolver pick
    /// up a retrying step that is now due.
    async fn wake_step(self: Arc<Self>, execution_id: Uuid, step_id: &str) -> EngineResult<()> {
        let lock = self.lock_for(execution_id).await;
        let guard = lock.lock().await;
        let mut execution = match self.executions.get(execution_id).await? {
            Some(e) if e.status.is_active() => e,
            _ => return Ok(()),
        };
        let step_status = execution.step(step_id)?.status;
        match step_status {
            StepStatus::WaitingTimer => {
                let due = execution.step(step_id)?.resume_at.is_none_or(|t| t <= Utc::now());
                if !due {
                    return Ok(());
                }
                let output = serde_json::json!({ "fired_at": Utc::now().to_rfc3339() });
                self.outputs.store(execution_id, step_id, &output).await?;
                execution.complete_step(step_id, output, 0.0)?;
                self.persist_and_publish(&mut execution).await?;
            }
            StepStatus::Retrying => {
                // Nothing to mutate; the resolver redispatches now that the
                // backoff has elapsed.
            }
            _ => return Ok(()),
        }
        drop(guard);
        self.advance(execution_id).await
    }

    fn arm_approval_deadline(
        self: Arc<Self>,
        execution_id: Uuid,
        approval_id: Uuid,
        at: DateTime<Utc>,
    ) {
        tokio::spawn(async move {
            sleep_until(at).await;
            if let Err(e) = self.approval_deadline(execution_id, approval_id).await {
                warn!(
                    execution_id = %execution_id,
                    approval_id = %approval_id,
                    error = %e,
                    "approval deadline handling failed"
                );
            }
        });
    }

    /// Deadline passed without a decision: apply the step's `on_timeout`.
    async fn approval_deadline(
        self: Arc<Self>,
        execution_id: Uuid,
        approval_id: Uuid,
    ) -> EngineResult<()> {
        let lock = self.lock_for(execution_id).await;
        let guard = lock.lock().await;
        let mut execution = match self.executions.get(execution_id).await? {
            Some(e) if e.status.is_active() => e,
            _ => return Ok(()),
        };
        if execution.approval(approval_id)?.status.is_terminal() {
            return Ok(());
        }
        let step_id = execution.timeout_approval(approval_id)?;
        let definition = self.load_definition(execution.process_id).await?;
        let step_def = definition
            .step(&step_id)
            .ok_or_else(|| EngineError::NotFound { resource: "step", id: step_id.clone() })?;
        let StepConfig::HumanApproval { on_timeout, .. } = &step_def.config else {
            return Err(EngineError::Internal(format!(
                "approval {approval_id} attached to non-approval step {step_id}"
            )));
        };

        if execution.status == ExecutionStatus::Paused {
            execution.resume_running()?;
        }
        match on_timeout {
            TimeoutAction::Approve => {
                let output = serde_json::json!({
                    "decision": "approved",
                    "decided_by": "system:timeout",
                });
                self.outputs.store(execution_id, &step_id, &output).await?;
                execution.complete_step(&step_id, output, 0.0)?;
            }
            TimeoutAction::Reject => {
                let failure = FailureInfo::new(
                    ErrorKind::Validation,
                    format!("approval {approval_id} rejected: deadline passed"),
                );
                execution.fail_step(&step_id, failure.clone())?;
                execution.fail(failure)?;
            }
            TimeoutAction::Skip => {
                execution.skip_step(&step_id, SkipReason::ApprovalTimedOut)?;
            }
        }
        self.persist_and_publish(&mut execution).await?;
        let status = execution.status;
        drop(guard);
        if status.is_terminal() {
            self.cleanup(execution_id).await;
        } else {
            self.advance(execution_id).await?;
        }
        Ok(())
    }

    /// Apply a human decision to a pending approval. Returns the execution
    /// id the approval belongs to.
    #[instrument(skip(self, comment), fields(approval_id = %approval_id), err)]
    pub async fn submit_approval(
        self: Arc<Self>,
        approval_id: Uuid,
        decision: ApprovalDecision,
        decided_by: &str,
        comment: Option<String>,
    ) -> EngineResult<Uuid> {
        let execution = self
            .executions
            .find_by_approval(approval_id)
            .await?
            .ok_or(EngineError::NotFound { resource: "approval", id: approval_id.to_string() })?;
        let execution_id = execution.id;

        let lock = self.lock_for(execution_id).await;
        let guard = lock.lock().await;
        let mut execution = self.load_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::StateConflict(format!(
                "execution {execution_id} is already {}",
                execution.status.as_str()
            )));
        }

        let step_id =
            execution.decide_approval(approval_id, decision, decided_by, comment.clone())?;
        let definition = self.load_definition(execution.process_id).await?;
        let step_def = definition
            .step(&step_id)
            .ok_or_else(|| EngineError::NotFound { resource: "step", id: step_id.clone() })?;
        let fail_on_reject = matches!(
            &step_def.config,
            StepConfig::HumanApproval { fail_on_reject: true, .. }
        );

        if execution.status == ExecutionStatus::Paused {
            execution.resume_running()?;
        }
        match decision {
            ApprovalDecision::Reject if fail_on_reject => {
                let failure = FailureInfo::new(
                    ErrorKind::Validation,
                    format!("approval {approval_id} rejected by {decided_by}"),
                );
                execution.fail_step(&step_id, failure.clone())?;
                execution.fail(failure)?;
            }
            _ => {
                let status = execution.approval(approval_id)?.status.as_str().to_string();
                let output = serde_json::json!({
                    "decision": status,
                    "decided_by": decided_by,
                    "comment": comment,
                });
                self.outputs.store(execution_id, &step_id, &output).await?;
                execution.complete_step(&step_id, output, 0.0)?;
            }
        }
        self.persist_and_publish(&mut execution).await?;
        let status = execution.status;
        drop(guard);

        if status.is_terminal() {
            self.cleanup(execution_id).await;
        } else {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.advance(execution_id).await {
                    error!(execution_id = %execution_id, error = %e, "advance after approval failed");
                }
            });
        }
        Ok(execution_id)
    }

    /// Cancel an execution. Running handlers are signalled; cancellation
    /// cascades to active children.
    ///
    /// Returns a boxed future (rather than `async fn`) because this method
    /// recurses directly (cascading cancel to children), which makes the
    /// compiler unable to resolve the opaque future's `Send`-ness otherwise.
    pub fn cancel<'a>(
        self: Arc<Self>,
        execution_id: Uuid,
        actor: &'a str,
        reason: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = EngineResult<()>> + Send + 'a>> {
        Box::pin(async move {
            {
                let lock = self.lock_for(execution_id).await;
                let _guard = lock.lock().await;
                let mut execution = self.load_execution(execution_id).await?;
                execution.cancel(actor, reason)?;
                self.persist_and_publish(&mut execution).await?;
            }

            // Signal in-flight handlers after the state is durable.
            if let Some(sender) = self.cancel_signals.lock().await.get(&execution_id) {
                let _ = sender.send(true);
            }

            let children = self.executions.list_active_children(execution_id).await?;
            for child in children {
                let engine = self.clone();
                let child_id = child.id;
                tokio::spawn(async move {
                    if let Err(e) =
                        engine.cancel(child_id, "system", "parent execution cancelled").await
                    {
                        warn!(child = %child_id, error = %e, "cascading cancel failed");
                    }
                });
            }
            self.cleanup(execution_id).await;
            Ok(())
        })
    }

    /// A child execution reached a terminal state: resume the sub-process
    /// step that spawned it. Duplicate notifications are no-ops.
    #[instrument(skip(self), fields(parent = %parent_execution_id, child = %child_execution_id), err)]
    pub async fn notify_child_terminal(
        self: Arc<Self>,
        parent_execution_id: Uuid,
        child_execution_id: Uuid,
    ) -> EngineResult<()> {
        let lock = self.lock_for(parent_execution_id).await;
        let guard = lock.lock().await;
        let mut execution = match self.executions.get(parent_execution_id).await? {
            Some(e) if e.status.is_active() => e,
            _ => return Ok(()),
        };

        let step_id = match execution
            .steps
            .values()
            .find(|s| s.child_execution_id == Some(child_execution_id) && !s.status.is_terminal())
        {
            Some(step) => step.step_id.clone(),
            // Already applied, or unknown child: deduplicate silently.
            None => return Ok(()),
        };

        let child = self.load_execution(child_execution_id).await?;
        if child.status.is_active() {
            return Ok(());
        }
        let definition = self.load_definition(execution.process_id).await?;
        let step_def = definition
            .step(&step_id)
            .ok_or_else(|| EngineError::NotFound { resource: "step", id: step_id.clone() })?;

        match child.status {
            ExecutionStatus::Completed => {
                let StepConfig::SubProcess { output_mapping, .. } = &step_def.config else {
                    return Err(EngineError::Internal(format!(
                        "child {child_execution_id} attached to non-sub-process step {step_id}"
                    )));
                };
                let mut child_ctx = execution_context(&child);
                if let Some(obj) = child_ctx.as_object_mut() {
                    obj.insert(
                        "output".to_string(),
                        child.output.clone().unwrap_or(Json::Null),
                    );
                }
                let mut mapped = serde_json::Map::new();
                for (key, template) in output_mapping {
                    mapped.insert(
                        key.clone(),
                        crate::services::handlers::sub_process::map_value(
                            &self.evaluator,
                            template,
                            &child_ctx,
                        )?,
                    );
                }
                let output = if mapped.is_empty() {
                    child.output.clone().unwrap_or(Json::Null)
                } else {
                    Json::Object(mapped)
                };
                self.outputs.store(parent_execution_id, &step_id, &output).await?;
                execution.complete_step(&step_id, output, child.total_cost)?;
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                let failure = child.failure.clone().unwrap_or_else(|| {
                    FailureInfo::new(ErrorKind::Cancelled, "child execution cancelled")
                });
                if step_def.config.on_error() == OnError::SkipStep {
                    execution.skip_step(&step_id, SkipReason::RetriesExhausted)?;
                } else {
                    let failure = FailureInfo::new(
                        failure.kind,
                        format!(
                            "child execution {child_execution_id} failed: {}",
                            failure.message
                        ),
                    );
                    execution.fail_step(&step_id, failure.clone())?;
                    execution.fail(failure)?;
                }
            }
            _ => unreachable!("child status checked active above"),
        }

        self.persist_and_publish(&mut execution).await?;
        let status = execution.status;
        drop(guard);
        if status.is_terminal() {
            self.cleanup(parent_execution_id).await;
        } else {
            self.advance(parent_execution_id).await?;
        }
        Ok(())
    }

    /// Re-enter an interrupted execution: re-arm timers and approval
    /// deadlines, poll waiting children, then advance. Used by recovery.
    pub async fn resume(self: Arc<Self>, execution_id: Uuid) -> EngineResult<()> {
        let mut waiting_children = Vec::new();
        {
            let lock = self.lock_for(execution_id).await;
            let _guard = lock.lock().await;
            let execution = self.load_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Ok(());
            }
            for step in execution.steps.values() {
                match step.status {
                    StepStatus::WaitingTimer => {
                        let at = step.resume_at.unwrap_or_else(Utc::now);
                        self.clone().arm_wake(execution_id, step.step_id.clone(), at);
                    }
                    StepStatus::Retrying => {
                        let at = step.not_before.unwrap_or_else(Utc::now);
                        self.clone().arm_wake(execution_id, step.step_id.clone(), at);
                    }
                    StepStatus::Running => {
                        if let Some(child_id) = step.child_execution_id {
                            waiting_children.push(child_id);
                        }
                    }
                    _ => {}
                }
            }
            for approval in execution.approvals.values() {
                if !approval.status.is_terminal() {
                    self.clone().arm_approval_deadline(
                        execution_id,
                        approval.id,
                        approval.deadline,
                    );
                }
            }
        }

        // Children may have finished while the engine was down; the bus
        // event is gone, so poll their stored state.
        for child_id in waiting_children {
            if let Some(child) = self.executions.get(child_id).await? {
                if child.status.is_terminal() {
                    self.clone()
                        .notify_child_terminal(execution_id, child_id)
                        .await?;
                }
            }
        }
        self.advance(execution_id).await
    }
}

/// Sleep until a wall-clock instant (returns immediately for the past).
async fn sleep_until(at: DateTime<Utc>) {
    let now = Utc::now();
    if at > now {
        let wait = (at - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
    }
}
