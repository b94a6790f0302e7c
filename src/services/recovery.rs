//! Startup recovery: resume, retry, or fail executions interrupted by a
//! crash or restart.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::errors::{EngineResult, ErrorKind};
use crate::domain::models::{ExecutionStatus, FailureInfo, StepStatus};
use crate::domain::ports::{ProcessDefinitionRepository, ProcessExecutionRepository};
use crate::services::engine::ExecutionEngine;

/// Recovery tuning.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Executions older than this are failed instead of resumed.
    pub max_age_hours: i64,
    /// Report what would be done without mutating anything.
    pub dry_run: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { max_age_hours: 24, dry_run: false }
    }
}

/// Outcome of a recovery pass, kept for the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub resumed: u32,
    pub retried: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: Vec<String>,
    pub dry_run: bool,
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

/// Scans active executions on startup and re-enters the engine for each.
pub struct RecoveryService {
    executions: Arc<dyn ProcessExecutionRepository>,
    definitions: Arc<dyn ProcessDefinitionRepository>,
    engine: Arc<ExecutionEngine>,
}

impl RecoveryService {
    pub fn new(
        executions: Arc<dyn ProcessExecutionRepository>,
        definitions: Arc<dyn ProcessDefinitionRepository>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        Self { executions, definitions, engine }
    }

    /// Run one recovery pass over every non-terminal execution.
    pub async fn run(&self, config: &RecoveryConfig) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport { dry_run: config.dry_run, ..Default::default() };
        let active = self
            .executions
            .list_by_status(&[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Paused,
            ])
            .await?;
        info!(count = active.len(), dry_run = config.dry_run, "recovery scan started");

        let now = Utc::now();
        for mut execution in active {
            let execution_id = execution.id;

            if execution.age_hours(now) > config.max_age_hours {
                if config.dry_run {
                    info!(execution_id = %execution_id, "would mark failed (recovery timeout)");
                    report.failed += 1;
                    continue;
                }
                execution.mark_recovered("mark_failed");
                let result = match execution
                    .fail(FailureInfo::new(ErrorKind::Timeout, "recovery timeout"))
                {
                    Ok(()) => self.save_and_flush(&mut execution).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => report.failed += 1,
                    Err(e) => report.errors.push(format!("{execution_id}: {e}")),
                }
                continue;
            }

            // Reset interrupted running steps (those without a live child) to
            // pending; non-idempotent handler kinds are charged a retry.
            let definition = match self.definitions.get(execution.process_id).await? {
                Some(d) => d,
                None => {
                    report
                        .errors
                        .push(format!("{execution_id}: definition {} missing", execution.process_id));
                    continue;
                }
            };
            let interrupted: Vec<(String, bool)> = execution
                .steps
                .values()
                .filter(|s| s.status == StepStatus::Running && s.child_execution_id.is_none())
                .map(|s| {
                    let bump = definition
                        .step(&s.step_id)
                        .map(|d| !d.kind().is_idempotent())
                        .unwrap_or(false);
                    (s.step_id.clone(), bump)
                })
                .collect();

            if config.dry_run {
                if interrupted.is_empty() {
                    info!(execution_id = %execution_id, "would resume");
                    report.resumed += 1;
                } else {
                    info!(
                        execution_id = %execution_id,
                        steps = interrupted.len(),
                        "would reset interrupted steps and resume"
                    );
                    report.retried += 1;
                }
                continue;
            }

            let had_interruptions = !interrupted.is_empty();
            let mut reset_failed = false;
            for (step_id, bump) in interrupted {
                if let Err(e) = execution.reset_step_for_recovery(&step_id, bump) {
                    report.errors.push(format!("{execution_id}/{step_id}: {e}"));
                    reset_failed = true;
                }
            }
            if reset_failed {
                continue;
            }

            execution.mark_recovered(if had_interruptions { "retry" } else { "resume" });
            if let Err(e) = self.save_and_flush(&mut execution).await {
                report.errors.push(format!("{execution_id}: {e}"));
                continue;
            }

            match self.engine.clone().resume(execution_id).await {
                Ok(()) => {
                    if had_interruptions {
                        report.retried += 1;
                    } else {
                        report.resumed += 1;
                    }
                }
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "resume failed");
                    report.errors.push(format!("{execution_id}: {e}"));
                }
            }
        }

        report.completed_at = Some(Utc::now());
        info!(
            resumed = report.resumed,
            retried = report.retried,
            failed = report.failed,
            errors = report.errors.len(),
            "recovery scan finished"
        );
        Ok(report)
    }

    async fn save_and_flush(
        &self,
        execution: &mut crate::domain::models::ProcessExecution,
    ) -> EngineResult<()> {
        self.executions.save(execution).await?;
        self.engine.bus().publish_all(execution.take_events());
        Ok(())
    }
}
