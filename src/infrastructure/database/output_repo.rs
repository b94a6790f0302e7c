//! SQLite implementation of the step-output store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::EngineResult;
use crate::domain::ports::OutputStore;

#[derive(Clone)]
pub struct SqliteOutputStore {
    pool: SqlitePool,
}

impl SqliteOutputStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutputStore for SqliteOutputStore {
    async fn store(
        &self,
        execution_id: Uuid,
        step_id: &str,
        value: &serde_json::Value,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO step_outputs
             (execution_id, step_id, content_type, body, created_at)
             VALUES (?, ?, 'application/json', ?, ?)",
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .bind(serde_json::to_string(value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retrieve(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> EngineResult<Option<serde_json::Value>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM step_outputs WHERE execution_id = ? AND step_id = ?",
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into)).transpose()
    }

    async fn delete_for_execution(&self, execution_id: Uuid) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM step_outputs WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
