//! HTTP adapter for the agent gateway.
//!
//! Talks to the agent runtime's REST surface: execute a task against a
//! named agent, probe availability, forward awareness payloads. Transport
//! failures map onto the engine's error taxonomy so retry policies can
//! classify them.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::ports::{AgentGateway, AgentTaskRequest, AgentTaskResult, Availability};

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
}

pub struct HttpAgentGateway {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    cost: Option<f64>,
    #[serde(default)]
    tokens_used: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_kind: Option<String>,
}

#[derive(Deserialize)]
struct AvailabilityResponse {
    available: bool,
    #[serde(default)]
    reason: Option<String>,
}

impl HttpAgentGateway {
    pub fn new(config: HttpGatewayConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| EngineError::Internal(format!("gateway client: {e}")))?;
        Ok(Self { client, base_url: config.base_url.trim_end_matches('/').to_string() })
    }

    fn classify(agent: &str, kind: Option<&str>, message: String) -> EngineError {
        match kind {
            Some("timeout") => EngineError::Timeout(message),
            Some("rate_limit") => EngineError::RateLimit(message),
            Some("agent_unavailable") => EngineError::AgentUnavailable(message),
            Some("invalid_config") => EngineError::Validation(message),
            _ => EngineError::Internal(format!("agent {agent}: {message}")),
        }
    }

    fn transport_error(agent: &str, err: &reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(format!("agent {agent} call timed out"))
        } else if err.is_connect() {
            EngineError::AgentUnavailable(format!("agent {agent} unreachable: {err}"))
        } else {
            EngineError::Internal(format!("agent {agent} transport error: {err}"))
        }
    }
}

#[async_trait]
impl AgentGateway for HttpAgentGateway {
    async fn execute(
        &self,
        request: AgentTaskRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> EngineResult<AgentTaskResult> {
        let url = format!("{}/agents/{}/execute", self.base_url, request.agent);
        let body = serde_json::json!({
            "message": request.message,
            "timeout_secs": request.timeout.as_secs(),
            "execution_id": request.execution_id,
            "step_id": request.step_id,
        });

        let send = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send();

        // The runtime has no cancel endpoint for in-flight calls; on cancel
        // we stop waiting and the engine discards any late result.
        let response = tokio::select! {
            response = send => response.map_err(|e| Self::transport_error(&request.agent, &e))?,
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Err(EngineError::Cancelled("agent call cancelled".into()));
                }
                return Err(EngineError::Internal("cancel channel closed".into()));
            }
        };

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(EngineError::RateLimit(format!("agent {} rate limited", request.agent)))
            }
            StatusCode::NOT_FOUND | StatusCode::SERVICE_UNAVAILABLE => {
                return Err(EngineError::AgentUnavailable(format!(
                    "agent {} not available",
                    request.agent
                )))
            }
            status if !status.is_success() => {
                return Err(EngineError::Internal(format!(
                    "agent {} returned {status}",
                    request.agent
                )))
            }
            _ => {}
        }

        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Internal(format!("agent response decode: {e}")))?;

        if parsed.success {
            debug!(agent = %request.agent, step = %request.step_id, "agent task succeeded");
            Ok(AgentTaskResult {
                content: parsed.content.unwrap_or_default(),
                cost: parsed.cost.unwrap_or(0.0),
                tokens_used: parsed.tokens_used.unwrap_or(0),
            })
        } else {
            let message = parsed.error.unwrap_or_else(|| "agent reported failure".to_string());
            Err(Self::classify(&request.agent, parsed.error_kind.as_deref(), message))
        }
    }

    async fn is_available(&self, agent: &str) -> EngineResult<Availability> {
        let url = format!("{}/agents/{agent}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(agent, &e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Availability { available: false, reason: Some("unknown agent".into()) });
        }
        let parsed: AvailabilityResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Internal(format!("availability decode: {e}")))?;
        Ok(Availability { available: parsed.available, reason: parsed.reason })
    }

    async fn notify_awareness(&self, agent: &str, payload: &serde_json::Value) -> EngineResult<()> {
        let url = format!("{}/agents/{agent}/awareness", self.base_url);
        self.client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Self::transport_error(agent, &e))?
            .error_for_status()
            .map_err(|e| EngineError::Internal(format!("awareness delivery: {e}")))?;
        Ok(())
    }
}
