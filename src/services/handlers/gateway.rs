//! Gateway handler: evaluates routes in declared order and reports the
//! selection. Non-selected targets are skipped by the resolver.

use async_trait::async_trait;

use super::{DispatchOutcome, StepContext, StepHandler};
use crate::domain::errors::{EngineError, EngineResult, ErrorKind};
use crate::domain::models::{FailureInfo, StepConfig};
use crate::services::dependency_resolver::select_routes;
use crate::services::expression::ExpressionEvaluator;

pub struct GatewayHandler {
    evaluator: ExpressionEvaluator,
}

impl GatewayHandler {
    pub fn new() -> Self {
        Self { evaluator: ExpressionEvaluator::new() }
    }
}

impl Default for GatewayHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepHandler for GatewayHandler {
    async fn dispatch(&self, ctx: &StepContext) -> EngineResult<DispatchOutcome> {
        let step = ctx.step()?;
        let StepConfig::Gateway { gateway_type, routes } = &step.config else {
            return Err(EngineError::Internal(format!(
                "gateway handler invoked for {} step {}",
                step.kind().as_str(),
                step.id
            )));
        };

        let selected = select_routes(&self.evaluator, *gateway_type, routes, &ctx.expr_ctx)?;
        if selected.is_empty() {
            return Ok(DispatchOutcome::Failed(FailureInfo::new(
                ErrorKind::NoMatchingRoute,
                format!("gateway {} matched no route and has no default", step.id),
            )));
        }
        Ok(DispatchOutcome::Routed(selected))
    }
}
