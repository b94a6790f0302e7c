//! Agent gateway port.
//!
//! The gateway is the boundary to the agent runtime. The engine treats it
//! as a black box that can run one message against a named agent and report
//! availability; container lifecycle lives entirely on the other side.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::errors::EngineResult;

/// A single task handed to an agent.
#[derive(Debug, Clone)]
pub struct AgentTaskRequest {
    pub agent: String,
    pub message: String,
    pub timeout: Duration,
    pub execution_id: Uuid,
    pub step_id: String,
}

/// Successful agent response.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTaskResult {
    pub content: String,
    pub cost: f64,
    pub tokens_used: u64,
}

/// Availability probe result.
#[derive(Debug, Clone, PartialEq)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
}

/// Boundary to the agent runtime.
///
/// `execute` honors the cancellation channel best-effort: runtimes that
/// cannot abort an in-flight call finish it, and the engine discards the
/// result.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    async fn execute(
        &self,
        request: AgentTaskRequest,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<AgentTaskResult>;

    async fn is_available(&self, agent: &str) -> EngineResult<Availability>;

    /// Forward a compact event payload to an informed agent.
    async fn notify_awareness(&self, agent: &str, payload: &serde_json::Value) -> EngineResult<()>;
}
