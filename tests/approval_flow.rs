//! Human approval flows: decisions, pausing, and deadline actions.

mod common;

use std::time::Duration;

use common::{agent_step, definition, variant_names, TestHarness};
use trinity::domain::errors::ErrorKind;
use trinity::domain::models::definition::{StepConfig, TimeoutAction};
use trinity::domain::models::{
    ApprovalDecision, ApprovalStatus, ExecutionStatus, SkipReason, StepDefinition, StepStatus,
};
use trinity::infrastructure::gateway::MockResponse;

fn approval_step(
    id: &str,
    deps: &[&str],
    timeout_secs: u64,
    on_timeout: TimeoutAction,
    fail_on_reject: bool,
) -> StepDefinition {
    let mut step = agent_step(id, deps, "unused", "unused");
    step.config = StepConfig::HumanApproval {
        approvers: vec!["alice@example.com".to_string()],
        timeout_secs,
        on_timeout,
        artifacts: vec![],
        title: Some("Review {{input.topic}}".to_string()),
        fail_on_reject,
    };
    step
}

#[tokio::test]
async fn approval_pauses_then_resumes_on_approve() {
    let harness = TestHarness::new().await;
    harness.gateway.script("draft", MockResponse::success("D")).await;
    harness.gateway.script("publish", MockResponse::success("P")).await;

    harness
        .publish(definition(
            "approved-pipeline",
            vec![
                agent_step("draft", &[], "draft", "draft {{input.topic}}"),
                approval_step("review", &["draft"], 3600, TimeoutAction::Reject, false),
                agent_step("publish", &["review"], "publish", "publish"),
            ],
        ))
        .await;

    let rx = harness.bus.subscribe();
    let execution_id = harness
        .trigger("approved-pipeline", serde_json::json!({"topic": "T"}))
        .await
        .unwrap();

    // The execution quiesces on the approval.
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Paused, Duration::from_secs(5))
        .await;
    let review = execution.step("review").unwrap();
    assert_eq!(review.status, StepStatus::WaitingApproval);
    let approval_id = review.approval_id.unwrap();
    let approval = execution.approval(approval_id).unwrap();
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert_eq!(approval.title.as_deref(), Some("Review T"));

    harness
        .engine
        .clone()
        .submit_approval(
            approval_id,
            ApprovalDecision::Approve,
            "alice@example.com",
            Some("lgtm".into()),
        )
        .await
        .unwrap();

    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;
    let review = execution.step("review").unwrap();
    assert_eq!(review.status, StepStatus::Completed);
    assert_eq!(review.output.as_ref().unwrap()["decision"], "approved");
    assert_eq!(review.output.as_ref().unwrap()["decided_by"], "alice@example.com");
    assert_eq!(execution.step("publish").unwrap().status, StepStatus::Completed);

    let events = harness
        .collect_events(rx, execution_id, Duration::from_secs(2))
        .await;
    let names = variant_names(&events);
    assert!(names.contains(&"ApprovalRequested"));
    assert!(names.contains(&"ApprovalDecided"));
}

#[tokio::test]
async fn approval_timeout_reject_fails_execution() {
    let harness = TestHarness::new().await;
    harness.gateway.script("draft", MockResponse::success("D")).await;

    harness
        .publish(definition(
            "deadline-pipeline",
            vec![
                agent_step("draft", &[], "draft", "draft"),
                approval_step("review", &["draft"], 2, TimeoutAction::Reject, false),
                agent_step("publish", &["review"], "publish", "publish"),
            ],
        ))
        .await;

    let rx = harness.bus.subscribe();
    let execution_id = harness
        .trigger("deadline-pipeline", serde_json::json!({"topic": "T"}))
        .await
        .unwrap();

    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Failed, Duration::from_secs(10))
        .await;
    let review = execution.step("review").unwrap();
    assert_eq!(review.status, StepStatus::Failed);
    let approval = execution.approval(review.approval_id.unwrap()).unwrap();
    assert_eq!(approval.status, ApprovalStatus::TimedOut);
    assert_eq!(execution.step("publish").unwrap().status, StepStatus::Skipped);

    let events = harness
        .collect_events(rx, execution_id, Duration::from_secs(2))
        .await;
    let names = variant_names(&events);
    assert!(names.contains(&"ApprovalTimedOut"));
    assert!(names.contains(&"StepFailed"));
    assert_eq!(*names.last().unwrap(), "ProcessFailed");
}

#[tokio::test]
async fn approval_timeout_skip_continues_downstream() {
    let harness = TestHarness::new().await;
    harness.gateway.script("draft", MockResponse::success("D")).await;
    harness.gateway.script("publish", MockResponse::success("P")).await;

    harness
        .publish(definition(
            "lenient-pipeline",
            vec![
                agent_step("draft", &[], "draft", "draft"),
                approval_step("review", &["draft"], 1, TimeoutAction::Skip, false),
                agent_step("publish", &["review"], "publish", "publish"),
            ],
        ))
        .await;

    let execution_id = harness
        .trigger("lenient-pipeline", serde_json::json!({}))
        .await
        .unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(10))
        .await;
    let review = execution.step("review").unwrap();
    assert_eq!(review.status, StepStatus::Skipped);
    assert_eq!(review.skip_reason, Some(SkipReason::ApprovalTimedOut));
    assert_eq!(execution.step("publish").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn rejection_is_data_by_default_and_fatal_when_configured() {
    let harness = TestHarness::new().await;
    harness.gateway.script("draft", MockResponse::success("D")).await;

    // Default: rejection completes the step carrying the decision; a
    // downstream condition routes on it.
    let mut after = agent_step("after", &["review"], "after", "follow up");
    after.condition = Some("steps.review.output.decision == 'approved'".into());
    harness
        .publish(definition(
            "soft-reject",
            vec![
                agent_step("draft", &[], "draft", "draft"),
                approval_step("review", &["draft"], 3600, TimeoutAction::Reject, false),
                after,
            ],
        ))
        .await;

    let execution_id = harness.trigger("soft-reject", serde_json::json!({})).await.unwrap();
    harness
        .wait_for_status(execution_id, ExecutionStatus::Paused, Duration::from_secs(5))
        .await;
    let execution = harness.executions.get(execution_id).await.unwrap().unwrap();
    let approval_id = execution.step("review").unwrap().approval_id.unwrap();

    harness
        .engine
        .clone()
        .submit_approval(approval_id, ApprovalDecision::Reject, "alice@example.com", None)
        .await
        .unwrap();

    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Completed, Duration::from_secs(5))
        .await;
    assert_eq!(execution.step("review").unwrap().status, StepStatus::Completed);
    assert_eq!(execution.step("after").unwrap().status, StepStatus::Skipped);

    // fail_on_reject: the same decision fails the execution.
    harness.gateway.script("draft", MockResponse::success("D")).await;
    harness
        .publish(definition(
            "hard-reject",
            vec![
                agent_step("draft", &[], "draft", "draft"),
                approval_step("review", &["draft"], 3600, TimeoutAction::Reject, true),
            ],
        ))
        .await;
    let execution_id = harness.trigger("hard-reject", serde_json::json!({})).await.unwrap();
    harness
        .wait_for_status(execution_id, ExecutionStatus::Paused, Duration::from_secs(5))
        .await;
    let execution = harness.executions.get(execution_id).await.unwrap().unwrap();
    let approval_id = execution.step("review").unwrap().approval_id.unwrap();

    harness
        .engine
        .clone()
        .submit_approval(approval_id, ApprovalDecision::Reject, "alice@example.com", None)
        .await
        .unwrap();
    let execution = harness
        .wait_for_status(execution_id, ExecutionStatus::Failed, Duration::from_secs(5))
        .await;
    assert_eq!(execution.step("review").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn double_decision_is_state_conflict() {
    let harness = TestHarness::new().await;
    harness.gateway.script("draft", MockResponse::success("D")).await;
    harness.gateway.script("publish", MockResponse::success("P")).await;

    harness
        .publish(definition(
            "decide-once",
            vec![
                agent_step("draft", &[], "draft", "draft"),
                approval_step("review", &["draft"], 3600, TimeoutAction::Reject, false),
                agent_step("publish", &["review"], "publish", "publish"),
            ],
        ))
        .await;

    let execution_id = harness.trigger("decide-once", serde_json::json!({})).await.unwrap();
    harness
        .wait_for_status(execution_id, ExecutionStatus::Paused, Duration::from_secs(5))
        .await;
    let execution = harness.executions.get(execution_id).await.unwrap().unwrap();
    let approval_id = execution.step("review").unwrap().approval_id.unwrap();

    harness
        .engine
        .clone()
        .submit_approval(approval_id, ApprovalDecision::Approve, "alice@example.com", None)
        .await
        .unwrap();
    let err = harness
        .engine
        .clone()
        .submit_approval(approval_id, ApprovalDecision::Reject, "alice@example.com", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
}
