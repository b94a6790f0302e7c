//! End-to-end engine scenarios against SQLite and the mock gateway.

mod common;

use std::time::Duration;

use common::{agent_step, agent_step_with_retry, assert_monotone, definition, variant_names, TestHarness};
use trinity::domain::errors::ErrorKind;
use trinity::domain::models::definition::{
    Backoff, GatewayRoute, GatewayType, OnError, RetryPolicy, StepConfig, TimerWait,
};
use trinity::domain::models::{ExecutionStatus, SkipReason, StepStatus};
use trinity::infrastructure::gateway::MockResponse;

#[tokio::test]
async fn sequential_three_step_pipeline() {
    let harness = TestHarness::new().await;
    harness.gateway.script("research", MockResponse::success_with_cost("R", 0.1)).await;
    harness.gateway.script("write", MockResponse::success_with_cost("W", 0.2)).await;
    harness.gateway.script("review", MockResponse::success_with_cost("V", 0.3)).await;

    harness
        .publish(definition(
            "content-pipeline",
            vec![
                agent_step("research", &[], "research", "research {{input.topic}}"),
                agent_step("write", &["research"], "write", "write up {{steps.research.output.content}}"),
                agent_step("review", &["write"], "review", "review {{steps.write.output.content}}"),
            ],
        ))
        .await;

    let rx = harness.bus.subscribe();
    let execution_id = harness
        .trigger("content-pipeline", serde_json::json!({"topic": "T"}))
        .await
        .unwrap();

    let events = harness
        .collect_events(rx, execution_id, Duration::from_secs(5))
        .await;
    assert_eq!(
        variant_names(&events),
        vec![
            "ProcessStarted",
            "StepStarted",
            "StepCompleted",
            "StepStarted",
            "StepCompleted",
            "StepStarted",
            "StepCompleted",
            "ProcessCompleted",
        ]
    );
    assert_monotone(&events);

    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(2))
        .await;
    assert!((execution.total_cost - 0.6).abs() < 1e-9);
    assert_eq!(execution.output, Some(serde_json::json!("V")));

    // The rendered messages flowed step to step.
    let calls = harness.gateway.calls().await;
    assert_eq!(calls[0].message, "research T");
    assert_eq!(calls[1].message, "write up R");
    assert_eq!(calls[2].message, "review W");
}

#[tokio::test]
async fn diamond_runs_branches_in_parallel() {
    let harness = TestHarness::new().await;
    harness.gateway.script("start", MockResponse::success("S")).await;
    harness
        .gateway
        .script("a", MockResponse::success("A").with_delay(Duration::from_millis(50)))
        .await;
    harness
        .gateway
        .script("b", MockResponse::success("B").with_delay(Duration::from_millis(500)))
        .await;
    harness.gateway.script("merge", MockResponse::success("M")).await;

    harness
        .publish(definition(
            "diamond",
            vec![
                agent_step("start", &[], "start", "go"),
                agent_step("a", &["start"], "a", "branch a"),
                agent_step("b", &["start"], "b", "branch b"),
                agent_step("merge", &["a", "b"], "merge", "join"),
            ],
        ))
        .await;

    let rx = harness.bus.subscribe();
    let execution_id = harness.trigger("diamond", serde_json::json!({})).await.unwrap();
    let events = harness
        .collect_events(rx, execution_id, Duration::from_secs(5))
        .await;
    assert_monotone(&events);

    let names: Vec<(&str, Option<String>)> = events
        .iter()
        .map(|e| (e.event.variant_name(), e.event.step_id().map(String::from)))
        .collect();

    // Both branch starts precede either branch completion.
    let idx = |variant: &str, step: &str| {
        names
            .iter()
            .position(|(v, s)| *v == variant && s.as_deref() == Some(step))
            .unwrap_or_else(|| panic!("missing {variant}({step})"))
    };
    assert!(idx("StepStarted", "a") < idx("StepCompleted", "a"));
    assert!(idx("StepStarted", "b") < idx("StepCompleted", "a"));
    assert!(idx("StepStarted", "b") < idx("StepCompleted", "b"));
    // merge starts only after both branches complete.
    assert!(idx("StepCompleted", "a") < idx("StepStarted", "merge"));
    assert!(idx("StepCompleted", "b") < idx("StepStarted", "merge"));

    harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(2))
        .await;
}

#[tokio::test]
async fn exclusive_gateway_selects_default_and_skips_rest() {
    let harness = TestHarness::new().await;
    harness.gateway.script("analyze", MockResponse::success("60")).await;
    harness.gateway.script("review", MockResponse::success("reviewed")).await;

    let mut route = agent_step("route", &["analyze"], "unused", "unused");
    route.config = StepConfig::Gateway {
        gateway_type: GatewayType::Exclusive,
        routes: vec![
            GatewayRoute {
                condition: Some("steps.analyze.output.content >= 80".into()),
                target_step: "publish".into(),
            },
            GatewayRoute { condition: None, target_step: "review".into() },
        ],
    };
    harness
        .publish(definition(
            "score-routing",
            vec![
                agent_step("analyze", &[], "analyze", "score it"),
                route,
                agent_step("publish", &["route"], "publish", "publish"),
                agent_step("review", &["route"], "review", "review"),
            ],
        ))
        .await;

    let execution_id = harness.trigger("score-routing", serde_json::json!({})).await.unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;

    let route_step = execution.step("route").unwrap();
    assert_eq!(route_step.status, StepStatus::Completed);
    assert_eq!(route_step.selected_routes, vec!["review".to_string()]);

    let publish = execution.step("publish").unwrap();
    assert_eq!(publish.status, StepStatus::Skipped);
    assert_eq!(publish.skip_reason, Some(SkipReason::GatewayNotSelected));
    assert_eq!(execution.step("review").unwrap().status, StepStatus::Completed);

    // The skipped branch's agent was never invoked.
    let calls = harness.gateway.calls().await;
    assert!(calls.iter().all(|c| c.agent != "publish"));
}

#[tokio::test]
async fn retry_exhaustion_with_skip_step_continues_downstream() {
    let harness = TestHarness::new().await;
    harness.gateway.script("flaky", MockResponse::failure(ErrorKind::Timeout)).await;
    harness.gateway.script("wrap", MockResponse::success("done")).await;

    let retry = RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::Fixed,
        initial_delay_ms: 30,
        max_delay_ms: 100,
        ..Default::default()
    };
    harness
        .publish(definition(
            "tolerant",
            vec![
                agent_step_with_retry("flaky", &[], "flaky", retry, OnError::SkipStep),
                agent_step("wrap", &["flaky"], "wrap", "wrap up"),
            ],
        ))
        .await;

    let rx = harness.bus.subscribe();
    let execution_id = harness
        .trigger("tolerant", serde_json::json!({"topic": "T"}))
        .await
        .unwrap();
    let events = harness
        .collect_events(rx, execution_id, Duration::from_secs(10))
        .await;

    let retrying = events
        .iter()
        .filter(|e| e.event.variant_name() == "StepRetrying")
        .count();
    // Three attempts total: two backoffs between them.
    assert_eq!(retrying, 2);

    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(2))
        .await;
    let flaky = execution.step("flaky").unwrap();
    assert_eq!(flaky.status, StepStatus::Skipped);
    assert_eq!(flaky.skip_reason, Some(SkipReason::RetriesExhausted));
    assert_eq!(flaky.retry_count, 2);
    assert_eq!(execution.step("wrap").unwrap().status, StepStatus::Completed);

    // Three gateway calls were actually made.
    let flaky_calls =
        harness.gateway.calls().await.iter().filter(|c| c.agent == "flaky").count();
    assert_eq!(flaky_calls, 3);
}

#[tokio::test]
async fn condition_false_skips_without_invoking_handler() {
    let harness = TestHarness::new().await;
    harness.gateway.script("first", MockResponse::success("out")).await;

    let mut conditional = agent_step("maybe", &["first"], "maybe", "run");
    conditional.condition = Some("input.enabled == true".into());
    harness
        .publish(definition(
            "guarded",
            vec![agent_step("first", &[], "first", "go"), conditional],
        ))
        .await;

    let execution_id = harness
        .trigger("guarded", serde_json::json!({"enabled": false}))
        .await
        .unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;

    let maybe = execution.step("maybe").unwrap();
    assert_eq!(maybe.status, StepStatus::Skipped);
    assert_eq!(maybe.skip_reason, Some(SkipReason::ConditionFalse));
    assert!(harness.gateway.calls().await.iter().all(|c| c.agent != "maybe"));
}

#[tokio::test]
async fn failed_step_fails_execution_and_skips_downstream() {
    let harness = TestHarness::new().await;
    harness.gateway.script("broken", MockResponse::failure(ErrorKind::Validation)).await;

    harness
        .publish(definition(
            "fragile",
            vec![
                agent_step("broken", &[], "broken", "explode"),
                agent_step("after", &["broken"], "after", "never"),
            ],
        ))
        .await;

    let rx = harness.bus.subscribe();
    let execution_id = harness.trigger("fragile", serde_json::json!({})).await.unwrap();
    let events = harness
        .collect_events(rx, execution_id, Duration::from_secs(5))
        .await;
    assert_eq!(events.last().unwrap().event.variant_name(), "ProcessFailed");

    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Failed, Duration::from_secs(2))
        .await;
    assert_eq!(execution.step("broken").unwrap().status, StepStatus::Failed);
    assert_eq!(execution.step("after").unwrap().status, StepStatus::Skipped);
    assert_eq!(execution.failure.as_ref().unwrap().kind, ErrorKind::Validation);
}

#[tokio::test]
async fn timer_step_fires_and_execution_continues() {
    let harness = TestHarness::new().await;
    harness.gateway.script("after-timer", MockResponse::success("late")).await;

    let mut wait = agent_step("wait", &[], "unused", "unused");
    wait.config = StepConfig::Timer { wait: TimerWait::Duration { seconds: 1 } };
    harness
        .publish(definition(
            "delayed",
            vec![wait, agent_step("after-timer", &["wait"], "after-timer", "go")],
        ))
        .await;

    let started = tokio::time::Instant::now();
    let execution_id = harness.trigger("delayed", serde_json::json!({})).await.unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(execution.step("wait").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn process_budget_cap_fails_execution() {
    let harness = TestHarness::new().await;
    harness.gateway.script("pricey", MockResponse::success_with_cost("x", 0.5)).await;

    let mut def = definition(
        "budgeted",
        vec![
            agent_step("pricey", &[], "pricey", "spend"),
            agent_step("more", &["pricey"], "more", "spend again"),
        ],
    );
    def.max_cost = Some(0.3);
    harness.publish(def).await;

    let execution_id = harness.trigger("budgeted", serde_json::json!({})).await.unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Failed, Duration::from_secs(5))
        .await;
    assert_eq!(execution.failure.as_ref().unwrap().kind, ErrorKind::BudgetExceeded);
    // The second step never dispatched.
    assert!(harness.gateway.calls().await.iter().all(|c| c.agent != "more"));
}

#[tokio::test]
async fn cancel_terminates_running_execution() {
    let harness = TestHarness::new().await;
    harness
        .gateway
        .script("slow", MockResponse::success("never").with_delay(Duration::from_secs(10)))
        .await;

    harness
        .publish(definition("cancellable", vec![agent_step("slow", &[], "slow", "work")]))
        .await;

    let execution_id = harness.trigger("cancellable", serde_json::json!({})).await.unwrap();
    // Let the step reach the gateway.
    tokio::time::sleep(Duration::from_millis(200)).await;

    harness
        .engine
        .clone()
        .cancel(execution_id, "ops@example.com", "superseded")
        .await
        .unwrap();

    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Cancelled, Duration::from_secs(2))
        .await;
    let slow = execution.step("slow").unwrap();
    assert_eq!(slow.status, StepStatus::Failed);
    assert_eq!(slow.error.as_ref().unwrap().kind, ErrorKind::Cancelled);

    // Cancelling again is a state conflict.
    let err = harness
        .engine
        .clone()
        .cancel(execution_id, "ops@example.com", "again")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
}

#[tokio::test]
async fn sub_process_maps_child_output_into_parent() {
    let harness = TestHarness::new().await;
    harness.gateway.script("child-agent", MockResponse::success("CHILD")).await;

    harness
        .publish(definition(
            "child-proc",
            vec![agent_step("c1", &[], "child-agent", "child work on {{input.topic}}")],
        ))
        .await;

    let mut sp = agent_step("sp", &[], "unused", "unused");
    sp.config = StepConfig::SubProcess {
        process: "child-proc".into(),
        version: None,
        input_mapping: std::collections::HashMap::from([(
            "topic".to_string(),
            "{{input.topic}}".to_string(),
        )]),
        output_mapping: std::collections::HashMap::from([(
            "result".to_string(),
            "{{output}}".to_string(),
        )]),
        on_error: OnError::Fail,
    };
    harness.publish(definition("parent-proc", vec![sp])).await;

    let execution_id = harness
        .trigger("parent-proc", serde_json::json!({"topic": "T"}))
        .await
        .unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;

    assert_eq!(execution.output, Some(serde_json::json!({"result": "CHILD"})));
    let sp_step = execution.step("sp").unwrap();
    assert_eq!(sp_step.status, StepStatus::Completed);
    assert!(sp_step.child_execution_id.is_some());

    // The child saw the mapped input.
    let calls = harness.gateway.calls().await;
    assert_eq!(calls[0].message, "child work on T");

    // The child execution itself completed and carries its parentage.
    let child = harness
        .executions
        .get(sp_step.child_execution_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.status, ExecutionStatus::Completed);
    assert_eq!(child.triggered_by.parent_execution_id, Some(execution_id));
}

#[tokio::test]
async fn duplicate_child_terminal_notification_is_noop() {
    let harness = TestHarness::new().await;
    harness.gateway.script("child-agent", MockResponse::success("CHILD")).await;
    harness
        .publish(definition(
            "child-proc",
            vec![agent_step("c1", &[], "child-agent", "work")],
        ))
        .await;
    let mut sp = agent_step("sp", &[], "unused", "unused");
    sp.config = StepConfig::SubProcess {
        process: "child-proc".into(),
        version: None,
        input_mapping: std::collections::HashMap::new(),
        output_mapping: std::collections::HashMap::new(),
        on_error: OnError::Fail,
    };
    harness.publish(definition("parent-proc", vec![sp])).await;

    let execution_id = harness.trigger("parent-proc", serde_json::json!({})).await.unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;
    let child_id = execution.step("sp").unwrap().child_execution_id.unwrap();
    let sequence_before = execution.sequence;

    // Replaying the terminal notification changes nothing.
    harness
        .engine
        .clone()
        .notify_child_terminal(execution_id, child_id)
        .await
        .unwrap();
    let after = harness.executions.get(execution_id).await.unwrap().unwrap();
    assert_eq!(after.sequence, sequence_before);
    assert_eq!(after.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn notification_step_delivers_through_sink() {
    let harness = TestHarness::new().await;
    harness.gateway.script("draft", MockResponse::success("D")).await;

    let mut notify = agent_step("notify", &["draft"], "unused", "unused");
    notify.config = StepConfig::Notification {
        channels: vec!["slack".to_string()],
        message: "draft ready: {{steps.draft.output.content}}".to_string(),
        recipients: vec!["team@example.com".to_string()],
        retry: None,
        on_error: OnError::Fail,
    };
    harness
        .publish(definition(
            "notifying",
            vec![agent_step("draft", &[], "draft", "d"), notify],
        ))
        .await;

    let execution_id = harness.trigger("notifying", serde_json::json!({})).await.unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;
    assert_eq!(
        execution.step("notify").unwrap().output.as_ref().unwrap()["delivered_count"],
        1
    );

    let deliveries = harness.notifications.deliveries.lock().await;
    assert_eq!(deliveries.len(), 1);
    let (channels, recipients, message) = &deliveries[0];
    assert_eq!(channels, &vec!["slack".to_string()]);
    assert_eq!(recipients, &vec!["team@example.com".to_string()]);
    assert_eq!(message, "draft ready: D");
}

#[tokio::test]
async fn informed_agents_receive_awareness_payloads() {
    let harness = TestHarness::new().await;
    harness.gateway.script("worker", MockResponse::success("done")).await;

    let mut step = agent_step("task", &[], "worker", "work");
    step.informed_agents = vec!["observer".to_string()];
    harness.publish(definition("observed", vec![step])).await;

    let execution_id = harness.trigger("observed", serde_json::json!({})).await.unwrap();
    harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;

    // The awareness sink forwards asynchronously; give it a beat.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let payloads = harness.gateway.awareness_payloads().await;
        if !payloads.is_empty() {
            let (agent, payload) = &payloads[0];
            assert_eq!(agent, "observer");
            assert_eq!(payload["step_id"], "task");
            assert_eq!(payload["process"], "observed");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no awareness payload arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
