//! SQLite implementation of the process definition repository.
//!
//! Definitions persist as a JSON document plus indexed columns; uniqueness
//! holds on (name, version).

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{DefinitionStatus, ProcessDefinition, Version};
use crate::domain::ports::ProcessDefinitionRepository;

#[derive(Clone)]
pub struct SqliteDefinitionRepository {
    pool: SqlitePool,
}

impl SqliteDefinitionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse(doc: &str) -> EngineResult<ProcessDefinition> {
        Ok(serde_json::from_str(doc)?)
    }
}

#[async_trait]
impl ProcessDefinitionRepository for SqliteDefinitionRepository {
    async fn save(&self, definition: &ProcessDefinition) -> EngineResult<()> {
        let doc = serde_json::to_string(definition)?;
        sqlx::query(
            "INSERT INTO process_definitions (id, name, version, status, owner_team, created_at, doc)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET status = excluded.status, doc = excluded.doc",
        )
        .bind(definition.id.to_string())
        .bind(&definition.name)
        .bind(definition.version.to_string())
        .bind(definition.status.as_str())
        .bind(&definition.owner_team)
        .bind(definition.created_at.to_rfc3339())
        .bind(&doc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
                EngineError::StateConflict(format!(
                    "process {} v{} already exists",
                    definition.name, definition.version
                ))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<ProcessDefinition>> {
        let doc: Option<String> =
            sqlx::query_scalar("SELECT doc FROM process_definitions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        doc.map(|d| Self::parse(&d)).transpose()
    }

    async fn get_by_name(
        &self,
        name: &str,
        version: Option<Version>,
    ) -> EngineResult<Option<ProcessDefinition>> {
        let doc: Option<String> = match version {
            Some(v) => {
                sqlx::query_scalar(
                    "SELECT doc FROM process_definitions WHERE name = ? AND version = ?",
                )
                .bind(name)
                .bind(v.to_string())
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                // Version strings sort lexically wrong ("1.10" < "1.2"), so
                // order in memory instead.
                let docs: Vec<String> =
                    sqlx::query_scalar("SELECT doc FROM process_definitions WHERE name = ?")
                        .bind(name)
                        .fetch_all(&self.pool)
                        .await?;
                let mut definitions = docs
                    .iter()
                    .map(|d| Self::parse(d))
                    .collect::<EngineResult<Vec<_>>>()?;
                definitions.sort_by_key(|d| d.version);
                return Ok(definitions.pop());
            }
        };
        doc.map(|d| Self::parse(&d)).transpose()
    }

    async fn latest_published(&self, name: &str) -> EngineResult<Option<ProcessDefinition>> {
        let docs: Vec<String> = sqlx::query_scalar(
            "SELECT doc FROM process_definitions WHERE name = ? AND status = 'published'",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        let mut definitions = docs
            .iter()
            .map(|d| Self::parse(d))
            .collect::<EngineResult<Vec<_>>>()?;
        definitions.sort_by_key(|d| d.version);
        Ok(definitions.pop())
    }

    async fn list(&self, status: Option<DefinitionStatus>) -> EngineResult<Vec<ProcessDefinition>> {
        let docs: Vec<String> = match status {
            Some(s) => {
                sqlx::query_scalar(
                    "SELECT doc FROM process_definitions WHERE status = ? ORDER BY name, version",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT doc FROM process_definitions ORDER BY name, version")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        docs.iter().map(|d| Self::parse(d)).collect()
    }

    async fn delete(&self, id: Uuid) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM process_definitions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound { resource: "process", id: id.to_string() });
        }
        Ok(())
    }
}
