//! Sub-process handler: maps the child's input and asks the coordinator to
//! trigger it. The step resumes when the child's terminal event arrives.

use async_trait::async_trait;
use serde_json::Value as Json;

use super::{DispatchOutcome, StepContext, StepHandler, SuspendReason};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::StepConfig;
use crate::services::expression::ExpressionEvaluator;

pub struct SubProcessHandler {
    evaluator: ExpressionEvaluator,
}

impl SubProcessHandler {
    pub fn new() -> Self {
        Self { evaluator: ExpressionEvaluator::new() }
    }
}

impl Default for SubProcessHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve one mapping value. A bare `{{expr}}` keeps the value's JSON type;
/// anything else renders to a string.
pub fn map_value(
    evaluator: &ExpressionEvaluator,
    template: &str,
    ctx: &Json,
) -> EngineResult<Json> {
    let trimmed = template.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
        let inner = &trimmed[2..trimmed.len() - 2];
        let value = evaluator.eval(inner, ctx)?;
        return Ok(match value {
            crate::services::expression::EvalValue::Missing
            | crate::services::expression::EvalValue::Null => Json::Null,
            crate::services::expression::EvalValue::Bool(b) => Json::Bool(b),
            crate::services::expression::EvalValue::Number(n) => serde_json::Number::from_f64(n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            crate::services::expression::EvalValue::Str(s) => Json::String(s),
        });
    }
    Ok(Json::String(evaluator.render(template, ctx)?))
}

#[async_trait]
impl StepHandler for SubProcessHandler {
    async fn dispatch(&self, ctx: &StepContext) -> EngineResult<DispatchOutcome> {
        let step = ctx.step()?;
        let StepConfig::SubProcess { process, version, input_mapping, .. } = &step.config else {
            return Err(EngineError::Internal(format!(
                "sub-process handler invoked for {} step {}",
                step.kind().as_str(),
                step.id
            )));
        };

        let mut input = serde_json::Map::new();
        for (key, template) in input_mapping {
            input.insert(key.clone(), map_value(&self.evaluator, template, &ctx.expr_ctx)?);
        }

        Ok(DispatchOutcome::Suspended(SuspendReason::Child {
            process: process.clone(),
            version: *version,
            input: Json::Object(input),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_value_preserves_types_for_bare_expressions() {
        let eval = ExpressionEvaluator::new();
        let ctx = json!({"steps": {"a": {"output": {"score": 60, "name": "x"}}}});
        assert_eq!(
            map_value(&eval, "{{steps.a.output.score}}", &ctx).unwrap(),
            json!(60.0)
        );
        assert_eq!(
            map_value(&eval, "{{steps.a.output.name}}", &ctx).unwrap(),
            json!("x")
        );
        assert_eq!(map_value(&eval, "{{steps.a.output.nope}}", &ctx).unwrap(), Json::Null);
    }

    #[test]
    fn test_map_value_renders_mixed_templates() {
        let eval = ExpressionEvaluator::new();
        let ctx = json!({"input": {"topic": "rust"}});
        assert_eq!(
            map_value(&eval, "about {{input.topic}}", &ctx).unwrap(),
            json!("about rust")
        );
    }
}
