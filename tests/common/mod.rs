//! Shared harness for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use trinity::domain::models::definition::{OnError, RetryPolicy};
use trinity::domain::models::{
    EventEnvelope, ExecutionStatus, ProcessDefinition, ProcessExecution, StepConfig,
    StepDefinition, TriggeredBy,
};
use trinity::domain::ports::{
    AuditRepository, OutputStore, ProcessDefinitionRepository, ProcessExecutionRepository,
};
use trinity::infrastructure::database::{
    DatabaseConnection, SqliteAuditRepository, SqliteDefinitionRepository,
    SqliteExecutionRepository, SqliteOutputStore,
};
use trinity::infrastructure::gateway::MockAgentGateway;
use trinity::infrastructure::notify::MockNotificationSink;
use trinity::services::agent_queue::{AgentExecutionQueue, QueueConfig};
use trinity::services::engine::ExecutionEngine;
use trinity::services::event_bus::{EventBus, EventBusConfig};
use trinity::services::handlers::StepHandlers;
use trinity::services::limits::{ExecutionLimitService, LimitConfig};
use trinity::services::recovery::RecoveryService;
use trinity::services::sinks;

pub struct TestHarness {
    pub engine: Arc<ExecutionEngine>,
    pub definitions: Arc<dyn ProcessDefinitionRepository>,
    pub executions: Arc<dyn ProcessExecutionRepository>,
    pub outputs: Arc<dyn OutputStore>,
    pub audit: Arc<dyn AuditRepository>,
    pub gateway: Arc<MockAgentGateway>,
    pub notifications: Arc<MockNotificationSink>,
    pub bus: Arc<EventBus>,
    _tempdir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite:{}", tempdir.path().join("trinity.db").display());
        let db = DatabaseConnection::new(&url, 4).await.expect("connect");
        db.migrate().await.expect("migrate");

        let definitions: Arc<dyn ProcessDefinitionRepository> =
            Arc::new(SqliteDefinitionRepository::new(db.pool().clone()));
        let executions: Arc<dyn ProcessExecutionRepository> =
            Arc::new(SqliteExecutionRepository::new(db.pool().clone()));
        let outputs: Arc<dyn OutputStore> = Arc::new(SqliteOutputStore::new(db.pool().clone()));
        let audit: Arc<dyn AuditRepository> =
            Arc::new(SqliteAuditRepository::new(db.pool().clone()));

        let gateway = MockAgentGateway::new();
        let notifications = Arc::new(MockNotificationSink::default());
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));
        let queue = Arc::new(AgentExecutionQueue::new(gateway.clone(), QueueConfig::default()));
        let limits = Arc::new(ExecutionLimitService::new(
            executions.clone(),
            LimitConfig::default(),
        ));
        let handlers = StepHandlers::new(queue, notifications.clone());
        let engine = ExecutionEngine::new(
            definitions.clone(),
            executions.clone(),
            outputs.clone(),
            handlers,
            bus.clone(),
            limits,
        );

        sinks::spawn_audit_sink(&bus, audit.clone());
        sinks::spawn_parent_resume_sink(&bus, executions.clone(), engine.clone());
        sinks::spawn_awareness_sink(
            &bus,
            executions.clone(),
            definitions.clone(),
            gateway.clone(),
        );

        Self {
            engine,
            definitions,
            executions,
            outputs,
            audit,
            gateway,
            notifications,
            bus,
            _tempdir: tempdir,
        }
    }

    pub fn recovery(&self) -> RecoveryService {
        RecoveryService::new(self.executions.clone(), self.definitions.clone(), self.engine.clone())
    }

    /// Publish a definition and return it.
    pub async fn publish(&self, mut definition: ProcessDefinition) -> ProcessDefinition {
        definition.publish().expect("publish");
        self.definitions.save(&definition).await.expect("save definition");
        definition
    }

    /// Start an execution as "alice" with the given input.
    pub async fn trigger(
        &self,
        process_name: &str,
        input: serde_json::Value,
    ) -> trinity::EngineResult<Uuid> {
        self.engine
            .clone()
            .start(process_name, None, input, TriggeredBy::manual("alice"), "alice")
            .await
    }

    /// Poll until the execution reaches the status (or panic after timeout).
    pub async fn wait_for_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        timeout: Duration,
    ) -> ProcessExecution {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let execution = self
                .executions
                .get(execution_id)
                .await
                .expect("load execution")
                .expect("execution exists");
            if execution.status == status {
                return execution;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "execution {execution_id} stuck in {:?} waiting for {:?}",
                execution.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Drain events for one execution until a terminal event arrives.
    pub async fn collect_events(
        &self,
        mut rx: broadcast::Receiver<EventEnvelope>,
        execution_id: Uuid,
        timeout: Duration,
    ) -> Vec<EventEnvelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(envelope)) => {
                    if envelope.execution_id != execution_id {
                        continue;
                    }
                    let terminal = envelope.event.is_terminal();
                    events.push(envelope);
                    if terminal {
                        return events;
                    }
                }
                Ok(Err(_)) | Err(_) => return events,
            }
        }
    }
}

/// Agent-task step builder for tests.
pub fn agent_step(id: &str, deps: &[&str], agent: &str, message: &str) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: deps.iter().map(|s| (*s).to_string()).collect(),
        condition: None,
        informed_agents: Vec::new(),
        config: StepConfig::AgentTask {
            agent: agent.to_string(),
            message: message.to_string(),
            timeout_secs: 10,
            max_cost: None,
            retry: None,
            on_error: OnError::Fail,
        },
    }
}

pub fn agent_step_with_retry(
    id: &str,
    deps: &[&str],
    agent: &str,
    retry: RetryPolicy,
    on_error: OnError,
) -> StepDefinition {
    let mut step = agent_step(id, deps, agent, "work on {{input.topic}}");
    step.config = StepConfig::AgentTask {
        agent: agent.to_string(),
        message: "work on {{input.topic}}".to_string(),
        timeout_secs: 10,
        max_cost: None,
        retry: Some(retry),
        on_error,
    };
    step
}

pub fn definition(name: &str, steps: Vec<StepDefinition>) -> ProcessDefinition {
    let mut def = ProcessDefinition::new_draft(name, "platform", "alice");
    def.steps = steps;
    def
}

/// Event variant names for one execution, in publish order.
pub fn variant_names(events: &[EventEnvelope]) -> Vec<&'static str> {
    events.iter().map(|e| e.event.variant_name()).collect()
}

/// Assert the per-execution sequence numbers strictly increase.
pub fn assert_monotone(events: &[EventEnvelope]) {
    for pair in events.windows(2) {
        assert!(
            pair[0].sequence < pair[1].sequence,
            "sequence regressed: {} then {}",
            pair[0].sequence,
            pair[1].sequence
        );
    }
}
