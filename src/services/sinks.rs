//! Event-bus sinks: audit, cross-agent awareness, and parent resumption.
//!
//! Each sink is an independent subscriber task. A slow sink can lag and drop
//! broadcast events for itself without affecting the others; lags are logged.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::domain::models::{AuditEntry, EventEnvelope, ExecutionEvent};
use crate::domain::ports::{
    AgentGateway, AuditRepository, ProcessDefinitionRepository, ProcessExecutionRepository,
};
use crate::services::engine::ExecutionEngine;
use crate::services::event_bus::EventBus;

/// Audit sink: one entry per state-changing event, actor always non-null.
pub fn spawn_audit_sink(
    bus: &EventBus,
    audit: Arc<dyn AuditRepository>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let entry = audit_entry_for(&envelope);
                    if let Err(e) = audit.append(&entry).await {
                        warn!(error = %e, "audit append failed");
                    }
                }
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "audit sink lagged behind the event bus");
                }
            }
        }
    })
}

fn audit_entry_for(envelope: &EventEnvelope) -> AuditEntry {
    let (resource_type, resource_id) = match &envelope.event {
        ExecutionEvent::ScheduleFired { schedule_id, .. } => {
            ("schedule", schedule_id.to_string())
        }
        _ => ("execution", envelope.execution_id.to_string()),
    };
    AuditEntry::new(
        envelope.event.actor(),
        envelope.event.audit_action(),
        resource_type,
        resource_id,
    )
    .with_details(serde_json::json!({
        "event": envelope.event.variant_name(),
        "sequence": envelope.sequence,
        "step_id": envelope.event.step_id(),
    }))
}

/// Awareness sink: forwards compact payloads of step events to agents the
/// definition lists as informed for that step.
pub fn spawn_awareness_sink(
    bus: &EventBus,
    executions: Arc<dyn ProcessExecutionRepository>,
    definitions: Arc<dyn ProcessDefinitionRepository>,
    gateway: Arc<dyn AgentGateway>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let Err(e) =
                        forward_awareness(&envelope, &executions, &definitions, &gateway).await
                    {
                        debug!(error = %e, "awareness forwarding failed");
                    }
                }
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "awareness sink lagged behind the event bus");
                }
            }
        }
    })
}

async fn forward_awareness(
    envelope: &EventEnvelope,
    executions: &Arc<dyn ProcessExecutionRepository>,
    definitions: &Arc<dyn ProcessDefinitionRepository>,
    gateway: &Arc<dyn AgentGateway>,
) -> crate::domain::errors::EngineResult<()> {
    let Some(step_id) = envelope.event.step_id() else {
        return Ok(());
    };
    let Some(execution) = executions.get(envelope.execution_id).await? else {
        return Ok(());
    };
    let Some(definition) = definitions.get(execution.process_id).await? else {
        return Ok(());
    };
    let Some(step) = definition.step(step_id) else {
        return Ok(());
    };
    if step.informed_agents.is_empty() {
        return Ok(());
    }

    let payload = serde_json::json!({
        "event": envelope.event.variant_name(),
        "execution_id": envelope.execution_id,
        "process": definition.name,
        "step_id": step_id,
        "sequence": envelope.sequence,
        "timestamp": envelope.timestamp.to_rfc3339(),
    });
    for agent in &step.informed_agents {
        if let Err(e) = gateway.notify_awareness(agent, &payload).await {
            debug!(agent = %agent, error = %e, "awareness notify failed");
        }
    }
    Ok(())
}

/// Parent-resume sink: when a child execution reaches a terminal state, call
/// back into the coordinator. Neither side holds a direct reference to the
/// other; this sink is the only link.
pub fn spawn_parent_resume_sink(
    bus: &EventBus,
    executions: Arc<dyn ProcessExecutionRepository>,
    engine: Arc<ExecutionEngine>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if !envelope.event.is_terminal() {
                        continue;
                    }
                    let child_id = envelope.execution_id;
                    let parent_id = match executions.get(child_id).await {
                        Ok(Some(child)) => child.triggered_by.parent_execution_id,
                        Ok(None) => None,
                        Err(e) => {
                            warn!(child = %child_id, error = %e, "parent lookup failed");
                            None
                        }
                    };
                    if let Some(parent_id) = parent_id {
                        if let Err(e) =
                            engine.clone().notify_child_terminal(parent_id, child_id).await
                        {
                            warn!(
                                parent = %parent_id,
                                child = %child_id,
                                error = %e,
                                "child terminal notification failed"
                            );
                        }
                    }
                }
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "parent-resume sink lagged behind the event bus");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_audit_entry_mapping() {
        let envelope = EventEnvelope::new(
            Uuid::new_v4(),
            7,
            ExecutionEvent::StepCompleted { step_id: "write".into(), cost: 0.5 },
        );
        let entry = audit_entry_for(&envelope);
        assert_eq!(entry.action, "step.complete");
        assert_eq!(entry.resource_type, "execution");
        assert_eq!(entry.actor, "system");
        assert_eq!(entry.details["sequence"], 7);
    }

    #[test]
    fn test_schedule_fired_audits_against_schedule() {
        let schedule_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            Uuid::new_v4(),
            0,
            ExecutionEvent::ScheduleFired { schedule_id, process_name: "nightly".into() },
        );
        let entry = audit_entry_for(&envelope);
        assert_eq!(entry.resource_type, "schedule");
        assert_eq!(entry.resource_id, schedule_id.to_string());
    }
}
