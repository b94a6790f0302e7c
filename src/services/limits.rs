//! Execution concurrency limits.
//!
//! Checked before an execution starts: a global running cap and a
//! per-process instance cap (from the definition, with a configured
//! default). Rejections surface as 429 at the HTTP edge.

use std::sync::Arc;

use crate::domain::errors::{EngineError, EngineResult, LimitScope};
use crate::domain::models::ProcessDefinition;
use crate::domain::ports::ProcessExecutionRepository;

/// Limit tuning.
#[derive(Debug, Clone)]
pub struct LimitConfig {
    pub max_concurrent_executions: u32,
    /// Per-process cap when the definition does not declare one.
    pub default_max_instances: u32,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self { max_concurrent_executions: 50, default_max_instances: 3 }
    }
}

/// Gatekeeper consulted by the engine before starting executions.
pub struct ExecutionLimitService {
    executions: Arc<dyn ProcessExecutionRepository>,
    config: LimitConfig,
}

impl ExecutionLimitService {
    pub fn new(executions: Arc<dyn ProcessExecutionRepository>, config: LimitConfig) -> Self {
        Self { executions, config }
    }

    /// Reject with `LimitExceeded` if starting another execution of this
    /// process would cross either cap.
    pub async fn check_can_start(&self, definition: &ProcessDefinition) -> EngineResult<()> {
        let global = self.executions.count_active().await?;
        if global >= self.config.max_concurrent_executions {
            return Err(EngineError::LimitExceeded {
                scope: LimitScope::Global,
                limit: self.config.max_concurrent_executions,
            });
        }

        let per_process = self.executions.count_active_for_process(definition.id).await?;
        let cap = definition
            .max_concurrent_instances
            .unwrap_or(self.config.default_max_instances);
        if per_process >= cap {
            return Err(EngineError::LimitExceeded {
                scope: LimitScope::PerProcess,
                limit: cap,
            });
        }
        Ok(())
    }
}
