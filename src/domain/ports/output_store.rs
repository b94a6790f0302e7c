//! Ephemeral step-output store port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::EngineResult;

/// Key-value store for step outputs, keyed by (execution, step). Writes are
/// non-overlapping in practice; reads are lock-free.
#[async_trait]
pub trait OutputStore: Send + Sync {
    async fn store(
        &self,
        execution_id: Uuid,
        step_id: &str,
        value: &serde_json::Value,
    ) -> EngineResult<()>;

    async fn retrieve(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> EngineResult<Option<serde_json::Value>>;

    /// Drop every output of an execution (retention purge).
    async fn delete_for_execution(&self, execution_id: Uuid) -> EngineResult<u64>;
}
