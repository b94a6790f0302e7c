//! Process execution repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::models::{ExecutionStatus, ProcessExecution};

/// Repository interface for execution persistence.
///
/// `save` is optimistic: the aggregate's `sequence` is the concurrency
/// token, and a write that would move the stored sequence backwards fails
/// with `StateConflict`.
#[async_trait]
pub trait ProcessExecutionRepository: Send + Sync {
    async fn save(&self, execution: &ProcessExecution) -> EngineResult<()>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<ProcessExecution>>;

    /// Find the execution owning the given approval.
    async fn find_by_approval(&self, approval_id: Uuid) -> EngineResult<Option<ProcessExecution>>;

    /// Executions in any of the given statuses.
    async fn list_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> EngineResult<Vec<ProcessExecution>>;

    /// Active (non-terminal) executions of a process.
    async fn list_active_for_process(
        &self,
        process_id: Uuid,
    ) -> EngineResult<Vec<ProcessExecution>>;

    /// Active child executions of a parent execution.
    async fn list_active_children(&self, parent_id: Uuid) -> EngineResult<Vec<ProcessExecution>>;

    /// Recent executions of a process, newest first.
    async fn list_history(
        &self,
        process_id: Uuid,
        limit: u32,
    ) -> EngineResult<Vec<ProcessExecution>>;

    /// Count of all active executions.
    async fn count_active(&self) -> EngineResult<u32>;

    /// Count of active executions of one process.
    async fn count_active_for_process(&self, process_id: Uuid) -> EngineResult<u32>;

    /// Delete terminal executions whose completion predates the cutoff.
    /// Returns the ids removed so dependent state can be purged with them.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Uuid>>;
}
