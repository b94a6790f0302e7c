//! Audit repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::models::{AuditEntry, AuditFilter};

/// Append-only audit store. Safe for concurrent appends.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> EngineResult<()>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<AuditEntry>>;

    async fn list(
        &self,
        filter: &AuditFilter,
        limit: u32,
        offset: u32,
    ) -> EngineResult<Vec<AuditEntry>>;

    async fn count(&self, filter: &AuditFilter) -> EngineResult<u64>;
}
