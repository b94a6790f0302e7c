//! Human approval handler: raises an approval record and suspends the step
//! until a decision or the deadline.

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{DispatchOutcome, StepContext, StepHandler, SuspendReason};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{Approval, StepConfig};
use crate::services::expression::ExpressionEvaluator;

pub struct HumanApprovalHandler {
    evaluator: ExpressionEvaluator,
}

impl HumanApprovalHandler {
    pub fn new() -> Self {
        Self { evaluator: ExpressionEvaluator::new() }
    }
}

impl Default for HumanApprovalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepHandler for HumanApprovalHandler {
    async fn dispatch(&self, ctx: &StepContext) -> EngineResult<DispatchOutcome> {
        let step = ctx.step()?;
        let StepConfig::HumanApproval { approvers, timeout_secs, artifacts, title, .. } =
            &step.config
        else {
            return Err(EngineError::Internal(format!(
                "approval handler invoked for {} step {}",
                step.kind().as_str(),
                step.id
            )));
        };

        let deadline = Utc::now() + Duration::seconds(*timeout_secs as i64);
        let mut approval = Approval::new(ctx.execution.id, &step.id, approvers.clone(), deadline);
        approval.artifacts = artifacts.clone();
        approval.title = match title {
            Some(t) => Some(self.evaluator.render(t, &ctx.expr_ctx)?),
            None => None,
        };

        Ok(DispatchOutcome::Suspended(SuspendReason::Approval(approval)))
    }
}
