//! Process definition repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::models::{DefinitionStatus, ProcessDefinition, Version};

/// Repository interface for process definition persistence.
#[async_trait]
pub trait ProcessDefinitionRepository: Send + Sync {
    /// Insert or replace a definition. Uniqueness holds on (name, version).
    async fn save(&self, definition: &ProcessDefinition) -> EngineResult<()>;

    /// Get a definition by id.
    async fn get(&self, id: Uuid) -> EngineResult<Option<ProcessDefinition>>;

    /// Get a definition by name, optionally pinned to a version.
    async fn get_by_name(
        &self,
        name: &str,
        version: Option<Version>,
    ) -> EngineResult<Option<ProcessDefinition>>;

    /// Latest published version of the named process.
    async fn latest_published(&self, name: &str) -> EngineResult<Option<ProcessDefinition>>;

    /// List definitions, optionally filtered by status.
    async fn list(&self, status: Option<DefinitionStatus>) -> EngineResult<Vec<ProcessDefinition>>;

    /// Delete a draft definition.
    async fn delete(&self, id: Uuid) -> EngineResult<()>;
}
