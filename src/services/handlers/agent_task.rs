//! Agent task handler: renders the message and runs it through the
//! per-agent execution queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{DispatchOutcome, StepContext, StepHandler};
use crate::domain::errors::{EngineError, EngineResult, ErrorKind};
use crate::domain::models::{FailureInfo, StepConfig};
use crate::domain::ports::AgentTaskRequest;
use crate::services::agent_queue::AgentExecutionQueue;
use crate::services::expression::ExpressionEvaluator;

pub struct AgentTaskHandler {
    queue: Arc<AgentExecutionQueue>,
    evaluator: ExpressionEvaluator,
}

impl AgentTaskHandler {
    pub fn new(queue: Arc<AgentExecutionQueue>) -> Self {
        Self { queue, evaluator: ExpressionEvaluator::new() }
    }
}

#[async_trait]
impl StepHandler for AgentTaskHandler {
    async fn dispatch(&self, ctx: &StepContext) -> EngineResult<DispatchOutcome> {
        let step = ctx.step()?;
        let StepConfig::AgentTask { agent, message, timeout_secs, max_cost, .. } = &step.config
        else {
            return Err(EngineError::Internal(format!(
                "agent task handler invoked for {} step {}",
                step.kind().as_str(),
                step.id
            )));
        };

        // Reject before dispatch if the execution's budget is already spent.
        if let Some(cap) = ctx.definition.max_cost {
            if ctx.execution.total_cost >= cap {
                return Ok(DispatchOutcome::Failed(FailureInfo::new(
                    ErrorKind::BudgetExceeded,
                    format!(
                        "execution cost {:.4} has reached the process cap {:.4}",
                        ctx.execution.total_cost, cap
                    ),
                )));
            }
        }

        // Fail fast on a known-down agent; probe errors fall through to the
        // queue, where the gateway call classifies them properly.
        if let Ok(availability) = self.queue.gateway().is_available(agent).await {
            if !availability.available {
                return Ok(DispatchOutcome::Failed(FailureInfo::new(
                    ErrorKind::AgentUnavailable,
                    availability
                        .reason
                        .unwrap_or_else(|| format!("agent {agent} is not available")),
                )));
            }
        }

        let rendered = self.evaluator.render(message, &ctx.expr_ctx)?;
        let request = AgentTaskRequest {
            agent: agent.clone(),
            message: rendered,
            timeout: Duration::from_secs(*timeout_secs),
            execution_id: ctx.execution.id,
            step_id: step.id.clone(),
        };

        let handle = match self
            .queue
            .submit(request, ctx.definition.priority, ctx.cancel.clone())
            .await
        {
            Ok(handle) => handle,
            Err(err) => return Ok(DispatchOutcome::Failed(FailureInfo::from(&err))),
        };

        debug!(step = %step.id, agent = %agent, "agent task queued");
        match handle.result().await {
            Ok(result) => {
                if let Some(cap) = max_cost {
                    if result.cost > *cap {
                        return Ok(DispatchOutcome::Failed(FailureInfo::new(
                            ErrorKind::BudgetExceeded,
                            format!("step cost {:.4} exceeds step cap {cap:.4}", result.cost),
                        )));
                    }
                }
                Ok(DispatchOutcome::Completed {
                    output: serde_json::json!({
                        "content": result.content,
                        "cost": result.cost,
                        "tokens_used": result.tokens_used,
                    }),
                    cost: result.cost,
                })
            }
            Err(err) => Ok(DispatchOutcome::Failed(FailureInfo::from(&err))),
        }
    }
}
