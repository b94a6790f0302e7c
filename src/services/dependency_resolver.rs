//! Readiness resolution over a definition and its execution state.
//!
//! Pure: given the same definition and execution, the resolver returns the
//! same ordered result. Steps become ready in definition order; the engine
//! may dispatch them in parallel but emits events in order.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::domain::errors::EngineResult;
use crate::domain::models::{
    ProcessDefinition, ProcessExecution, SkipReason, StepConfig, StepStatus,
};
use crate::services::expression::{execution_context, ExpressionEvaluator};

/// Result of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readiness {
    /// Steps to dispatch now, in definition order.
    pub ready: Vec<String>,
    /// Steps to mark skipped instead of dispatching, in definition order.
    pub skip: Vec<(String, SkipReason)>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.skip.is_empty()
    }
}

/// Computes the next set of dispatchable steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver {
    evaluator: ExpressionEvaluator,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self { evaluator: ExpressionEvaluator::new() }
    }

    /// Resolve the ready-set and skip-set at `now`.
    ///
    /// A step is ready iff it is dispatchable (pending, or retrying past its
    /// backoff), every predecessor is terminal without failure, it is not on
    /// a dead gateway branch, and its condition (if any) holds.
    pub fn resolve(
        &self,
        definition: &ProcessDefinition,
        execution: &ProcessExecution,
        now: DateTime<Utc>,
    ) -> EngineResult<Readiness> {
        let ctx = execution_context(execution);
        let mut readiness = Readiness::default();

        for step_def in &definition.steps {
            let step = execution.step(&step_def.id)?;
            if !step.is_dispatchable(now) {
                continue;
            }

            if let Some(reason) = self.dead_branch_reason(definition, execution, &step_def.id)? {
                readiness.skip.push((step_def.id.clone(), reason));
                continue;
            }

            let all_satisfied = step_def.depends_on.iter().try_fold(true, |acc, dep| {
                execution.step(dep).map(|d| acc && d.status.is_terminal())
            })?;
            if !all_satisfied {
                continue;
            }

            if let Some(condition) = &step_def.condition {
                if !self.evaluator.eval_predicate(condition, &ctx)? {
                    readiness
                        .skip
                        .push((step_def.id.clone(), SkipReason::ConditionFalse));
                    continue;
                }
            }

            readiness.ready.push(step_def.id.clone());
        }

        Ok(readiness)
    }

    /// Reason this step must be skipped because of its predecessors, if any.
    ///
    /// - A failed predecessor poisons the step (`upstream_failed`). A
    ///   predecessor that exhausted retries with `on_error = skip_step` is
    ///   `skipped`, not `failed`, and does not poison.
    /// - A completed gateway that routes to this step but did not select it
    ///   kills the branch (`gateway_not_selected`); the kill cascades down
    ///   chains whose every path runs through dead targets.
    fn dead_branch_reason(
        &self,
        definition: &ProcessDefinition,
        execution: &ProcessExecution,
        step_id: &str,
    ) -> EngineResult<Option<SkipReason>> {
        let step_def = match definition.step(step_id) {
            Some(s) => s,
            None => return Ok(None),
        };

        for dep_id in &step_def.depends_on {
            let dep_exec = execution.step(dep_id)?;
            if dep_exec.status == StepStatus::Failed {
                return Ok(Some(SkipReason::UpstreamFailed));
            }
            if let Some(dep_def) = definition.step(dep_id) {
                if let StepConfig::Gateway { routes, .. } = &dep_def.config {
                    let is_target = routes.iter().any(|r| r.target_step == *step_id);
                    if dep_exec.status == StepStatus::Completed
                        && is_target
                        && !dep_exec.selected_routes.iter().any(|r| r == step_id)
                    {
                        return Ok(Some(SkipReason::GatewayNotSelected));
                    }
                }
            }
        }

        // Cascade: every predecessor sits on a dead gateway branch.
        if !step_def.depends_on.is_empty() {
            let all_dead = step_def.depends_on.iter().try_fold(true, |acc, dep| {
                execution.step(dep).map(|d| {
                    acc && d.status == StepStatus::Skipped
                        && d.skip_reason == Some(SkipReason::GatewayNotSelected)
                })
            })?;
            if all_dead {
                return Ok(Some(SkipReason::GatewayNotSelected));
            }
        }

        Ok(None)
    }
}

/// Gateway route selection, shared by the gateway handler.
pub fn select_routes(
    evaluator: &ExpressionEvaluator,
    gateway_type: crate::domain::models::GatewayType,
    routes: &[crate::domain::models::GatewayRoute],
    ctx: &Json,
) -> EngineResult<Vec<String>> {
    use crate::domain::models::GatewayType;

    let mut selected = Vec::new();
    match gateway_type {
        GatewayType::Exclusive => {
            for route in routes {
                match &route.condition {
                    Some(cond) => {
                        if evaluator.eval_predicate(cond, ctx)? {
                            selected.push(route.target_step.clone());
                            break;
                        }
                    }
                    None => {}
                }
            }
            if selected.is_empty() {
                if let Some(default) = routes.iter().find(|r| r.condition.is_none()) {
                    selected.push(default.target_step.clone());
                }
            }
        }
        GatewayType::Parallel => {
            selected.extend(routes.iter().map(|r| r.target_step.clone()));
        }
        GatewayType::Inclusive => {
            for route in routes {
                if let Some(cond) = &route.condition {
                    if evaluator.eval_predicate(cond, ctx)? {
                        selected.push(route.target_step.clone());
                    }
                }
            }
            if selected.is_empty() {
                if let Some(default) = routes.iter().find(|r| r.condition.is_none()) {
                    selected.push(default.target_step.clone());
                }
            }
        }
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::definition::{
        GatewayRoute, GatewayType, OnError, ProcessDefinition, StepConfig, StepDefinition,
    };
    use crate::domain::models::{FailureInfo, TriggeredBy};
    use crate::domain::errors::ErrorKind;

    fn agent(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition {
            id: id.into(),
            name: id.into(),
            depends_on: deps.iter().map(|s| (*s).to_string()).collect(),
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
        }
    }

    fn published(steps: Vec<StepDefinition>) -> ProcessDefinition {
        let mut def = ProcessDefinition::new_draft("p", "team", "alice");
        def.steps = steps;
        def.publish().unwrap();
        def
    }

    fn execution(def: &ProcessDefinition) -> ProcessExecution {
        let mut exec = ProcessExecution::new(
            def,
            serde_json::json!({}),
            TriggeredBy::manual("alice"),
            "alice",
        );
        exec.begin().unwrap();
        exec
    }

    #[test]
    fn test_entry_steps_ready_in_definition_order() {
        let def = published(vec![agent("b", &[]), agent("a", &[]), agent("c", &["a"])]);
        let exec = execution(&def);
        let resolver = DependencyResolver::new();
        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(r.ready, vec!["b", "a"]);
        assert!(r.skip.is_empty());
    }

    #[test]
    fn test_re_resolution_is_deterministic() {
        let def = published(vec![agent("a", &[]), agent("b", &[])]);
        let exec = execution(&def);
        let resolver = DependencyResolver::new();
        let first = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        let second = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_step_waits_for_dependencies() {
        let def = published(vec![agent("a", &[]), agent("b", &["a"])]);
        let mut exec = execution(&def);
        let resolver = DependencyResolver::new();

        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(r.ready, vec!["a"]);

        exec.start_step("a").unwrap();
        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert!(r.is_empty());

        exec.complete_step("a", serde_json::json!("done"), 0.0).unwrap();
        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(r.ready, vec!["b"]);
    }

    #[test]
    fn test_failed_upstream_skips_downstream() {
        let def = published(vec![agent("a", &[]), agent("b", &["a"])]);
        let mut exec = execution(&def);
        exec.start_step("a").unwrap();
        exec.fail_step("a", FailureInfo::new(ErrorKind::Timeout, "slow")).unwrap();

        let resolver = DependencyResolver::new();
        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(r.skip, vec![("b".to_string(), SkipReason::UpstreamFailed)]);
    }

    #[test]
    fn test_skipped_upstream_counts_as_satisfied() {
        // a exhausted retries with on_error=skip_step -> skipped; b still runs.
        let def = published(vec![agent("a", &[]), agent("b", &["a"])]);
        let mut exec = execution(&def);
        exec.start_step("a").unwrap();
        exec.skip_step("a", SkipReason::RetriesExhausted).unwrap();

        let resolver = DependencyResolver::new();
        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(r.ready, vec!["b"]);
    }

    #[test]
    fn test_condition_false_schedules_skip() {
        let mut publish = agent("publish", &["analyze"]);
        publish.condition = Some("steps.analyze.output.score >= 80".into());
        let def = published(vec![agent("analyze", &[]), publish]);
        let mut exec = execution(&def);
        exec.start_step("analyze").unwrap();
        exec.complete_step("analyze", serde_json::json!({"score": 60}), 0.0).unwrap();

        let resolver = DependencyResolver::new();
        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(r.skip, vec![("publish".to_string(), SkipReason::ConditionFalse)]);
    }

    #[test]
    fn test_gateway_selection_skips_unselected_targets() {
        let mut gw = agent("route", &["analyze"]);
        gw.config = StepConfig::Gateway {
            gateway_type: GatewayType::Exclusive,
            routes: vec![
                GatewayRoute {
                    condition: Some("steps.analyze.output.score >= 80".into()),
                    target_step: "publish".into(),
                },
                GatewayRoute { condition: None, target_step: "review".into() },
            ],
        };
        let def = published(vec![
            agent("analyze", &[]),
            gw,
            agent("publish", &["route"]),
            agent("review", &["route"]),
            agent("notify", &["publish"]),
        ]);
        let mut exec = execution(&def);
        exec.start_step("analyze").unwrap();
        exec.complete_step("analyze", serde_json::json!({"score": 60}), 0.0).unwrap();
        exec.start_step("route").unwrap();
        exec.complete_gateway("route", vec!["review".into()]).unwrap();

        let resolver = DependencyResolver::new();
        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(r.ready, vec!["review"]);
        assert_eq!(r.skip, vec![("publish".to_string(), SkipReason::GatewayNotSelected)]);

        // The kill cascades to steps reachable only through the dead branch.
        exec.skip_step("publish", SkipReason::GatewayNotSelected).unwrap();
        let r = resolver.resolve(&def, &exec, Utc::now()).unwrap();
        assert_eq!(r.skip, vec![("notify".to_string(), SkipReason::GatewayNotSelected)]);
    }

    #[test]
    fn test_retrying_step_waits_for_backoff() {
        let def = published(vec![agent("a", &[])]);
        let mut exec = execution(&def);
        exec.start_step("a").unwrap();
        let not_before = Utc::now() + chrono::Duration::seconds(30);
        exec.retry_step("a", FailureInfo::new(ErrorKind::Timeout, "t"), not_before, 3, true)
            .unwrap();

        let resolver = DependencyResolver::new();
        let now = Utc::now();
        assert!(resolver.resolve(&def, &exec, now).unwrap().is_empty());
        let later = not_before + chrono::Duration::seconds(1);
        assert_eq!(resolver.resolve(&def, &exec, later).unwrap().ready, vec!["a"]);
    }

    #[test]
    fn test_route_selection_semantics() {
        let eval = ExpressionEvaluator::new();
        let ctx = serde_json::json!({"steps": {"a": {"output": {"score": 60}}}});
        let routes = vec![
            GatewayRoute {
                condition: Some("steps.a.output.score >= 80".into()),
                target_step: "high".into(),
            },
            GatewayRoute {
                condition: Some("steps.a.output.score >= 50".into()),
                target_step: "mid".into(),
            },
            GatewayRoute { condition: None, target_step: "fallback".into() },
        ];

        let exclusive = select_routes(&eval, GatewayType::Exclusive, &routes, &ctx).unwrap();
        assert_eq!(exclusive, vec!["mid"]);

        let parallel = select_routes(&eval, GatewayType::Parallel, &routes, &ctx).unwrap();
        assert_eq!(parallel, vec!["high", "mid", "fallback"]);

        let inclusive = select_routes(&eval, GatewayType::Inclusive, &routes, &ctx).unwrap();
        assert_eq!(inclusive, vec!["mid"]);

        // No condition matches and no default: empty selection.
        let strict = vec![GatewayRoute {
            condition: Some("steps.a.output.score >= 80".into()),
            target_step: "high".into(),
        }];
        let none = select_routes(&eval, GatewayType::Exclusive, &strict, &ctx).unwrap();
        assert!(none.is_empty());
    }
}
