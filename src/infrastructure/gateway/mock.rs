//! Mock agent gateway for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

use crate::domain::errors::{EngineError, EngineResult, ErrorKind};
use crate::domain::ports::{AgentGateway, AgentTaskRequest, AgentTaskResult, Availability};

/// Scripted response for a mock agent call.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub content: String,
    pub cost: f64,
    pub tokens_used: u64,
    /// When set, the call fails with this kind instead of succeeding.
    pub fail_with: Option<ErrorKind>,
    /// Simulated work duration.
    pub delay: Duration,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            content: "mock agent output".to_string(),
            cost: 0.01,
            tokens_used: 100,
            fail_with: None,
            delay: Duration::from_millis(0),
        }
    }
}

impl MockResponse {
    pub fn success(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Default::default() }
    }

    pub fn success_with_cost(content: impl Into<String>, cost: f64) -> Self {
        Self { content: content.into(), cost, ..Default::default() }
    }

    pub fn failure(kind: ErrorKind) -> Self {
        Self { fail_with: Some(kind), ..Default::default() }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Mock gateway with per-agent scripted responses. Responses queue in
/// order; the last one repeats once the queue drains.
pub struct MockAgentGateway {
    responses: RwLock<HashMap<String, Vec<MockResponse>>>,
    default_response: MockResponse,
    calls: Mutex<Vec<AgentTaskRequest>>,
    unavailable: RwLock<Vec<String>>,
    awareness: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MockAgentGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: RwLock::new(HashMap::new()),
            default_response: MockResponse::default(),
            calls: Mutex::new(Vec::new()),
            unavailable: RwLock::new(Vec::new()),
            awareness: Mutex::new(Vec::new()),
        })
    }

    /// Queue a response for the named agent.
    pub async fn script(&self, agent: &str, response: MockResponse) {
        self.responses.write().await.entry(agent.to_string()).or_default().push(response);
    }

    pub async fn mark_unavailable(&self, agent: &str) {
        self.unavailable.write().await.push(agent.to_string());
    }

    /// Requests seen so far, in arrival order.
    pub async fn calls(&self) -> Vec<AgentTaskRequest> {
        self.calls.lock().await.clone()
    }

    pub async fn awareness_payloads(&self) -> Vec<(String, serde_json::Value)> {
        self.awareness.lock().await.clone()
    }

    async fn next_response(&self, agent: &str) -> MockResponse {
        let mut responses = self.responses.write().await;
        match responses.get_mut(agent) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => self.default_response.clone(),
        }
    }
}

#[async_trait]
impl AgentGateway for MockAgentGateway {
    async fn execute(
        &self,
        request: AgentTaskRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> EngineResult<AgentTaskResult> {
        self.calls.lock().await.push(request.clone());
        let response = self.next_response(&request.agent).await;

        if response.delay > Duration::from_millis(0) {
            tokio::select! {
                () = tokio::time::sleep(response.delay) => {}
                result = cancel.changed() => {
                    if result.is_ok() && *cancel.borrow() {
                        return Err(EngineError::Cancelled("mock call cancelled".into()));
                    }
                }
            }
        }

        match response.fail_with {
            Some(ErrorKind::Timeout) => Err(EngineError::Timeout("mock timeout".into())),
            Some(ErrorKind::RateLimit) => Err(EngineError::RateLimit("mock rate limit".into())),
            Some(ErrorKind::AgentUnavailable) => {
                Err(EngineError::AgentUnavailable("mock agent down".into()))
            }
            Some(ErrorKind::Validation) => Err(EngineError::Validation("mock bad config".into())),
            Some(kind) => Err(EngineError::Internal(format!("mock failure: {kind}"))),
            None => Ok(AgentTaskResult {
                content: response.content,
                cost: response.cost,
                tokens_used: response.tokens_used,
            }),
        }
    }

    async fn is_available(&self, agent: &str) -> EngineResult<Availability> {
        let unavailable = self.unavailable.read().await;
        if unavailable.iter().any(|a| a == agent) {
            Ok(Availability { available: false, reason: Some("marked unavailable".into()) })
        } else {
            Ok(Availability { available: true, reason: None })
        }
    }

    async fn notify_awareness(&self, agent: &str, payload: &serde_json::Value) -> EngineResult<()> {
        self.awareness.lock().await.push((agent.to_string(), payload.clone()));
        Ok(())
    }
}
