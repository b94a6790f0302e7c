//! SQLite implementation of the process execution repository.
//!
//! The aggregate persists as a JSON document; status, ownership, and
//! timestamps are mirrored into columns for indexed queries. Saves are
//! optimistic on the aggregate sequence: a stale writer cannot move the
//! stored sequence backwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{ExecutionStatus, ProcessExecution};
use crate::domain::ports::ProcessExecutionRepository;

#[derive(Clone)]
pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse(doc: &str) -> EngineResult<ProcessExecution> {
        Ok(serde_json::from_str(doc)?)
    }

    fn parse_all(docs: &[String]) -> EngineResult<Vec<ProcessExecution>> {
        docs.iter().map(|d| Self::parse(d)).collect()
    }
}

#[async_trait]
impl ProcessExecutionRepository for SqliteExecutionRepository {
    async fn save(&self, execution: &ProcessExecution) -> EngineResult<()> {
        let doc = serde_json::to_string(execution)?;
        let now = Utc::now().to_rfc3339();
        let id = execution.id.to_string();

        let updated = sqlx::query(
            "UPDATE process_executions
             SET status = ?, sequence = ?, completed_at = ?, updated_at = ?, doc = ?
             WHERE id = ? AND sequence <= ?",
        )
        .bind(execution.status.as_str())
        .bind(execution.sequence as i64)
        .bind(execution.completed_at.map(|t| t.to_rfc3339()))
        .bind(&now)
        .bind(&doc)
        .bind(&id)
        .bind(execution.sequence as i64)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO process_executions
                 (id, process_id, status, owner_team, owner_user, parent_execution_id,
                  sequence, started_at, completed_at, updated_at, doc)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(execution.process_id.to_string())
            .bind(execution.status.as_str())
            .bind(&execution.owner_team)
            .bind(&execution.owner_user)
            .bind(execution.triggered_by.parent_execution_id.map(|p| p.to_string()))
            .bind(execution.sequence as i64)
            .bind(execution.started_at.to_rfc3339())
            .bind(execution.completed_at.map(|t| t.to_rfc3339()))
            .bind(&now)
            .bind(&doc)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 0 {
                return Err(EngineError::StateConflict(format!(
                    "execution {id} was modified concurrently (stale sequence {})",
                    execution.sequence
                )));
            }
        }

        for approval_id in execution.approvals.keys() {
            sqlx::query(
                "INSERT OR IGNORE INTO approval_index (approval_id, execution_id) VALUES (?, ?)",
            )
            .bind(approval_id.to_string())
            .bind(&id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<ProcessExecution>> {
        let doc: Option<String> =
            sqlx::query_scalar("SELECT doc FROM process_executions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        doc.map(|d| Self::parse(&d)).transpose()
    }

    async fn find_by_approval(&self, approval_id: Uuid) -> EngineResult<Option<ProcessExecution>> {
        let execution_id: Option<String> =
            sqlx::query_scalar("SELECT execution_id FROM approval_index WHERE approval_id = ?")
                .bind(approval_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        match execution_id {
            Some(id) => {
                let id = Uuid::parse_str(&id)
                    .map_err(|e| EngineError::Database(format!("corrupt approval index: {e}")))?;
                self.get(id).await
            }
            None => Ok(None),
        }
    }

    async fn list_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> EngineResult<Vec<ProcessExecution>> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT doc FROM process_executions WHERE status IN ({placeholders}) ORDER BY started_at"
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let docs = query.fetch_all(&self.pool).await?;
        Self::parse_all(&docs)
    }

    async fn list_active_for_process(
        &self,
        process_id: Uuid,
    ) -> EngineResult<Vec<ProcessExecution>> {
        let docs: Vec<String> = sqlx::query_scalar(
            "SELECT doc FROM process_executions
             WHERE process_id = ? AND status IN ('pending', 'running', 'paused')
             ORDER BY started_at",
        )
        .bind(process_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Self::parse_all(&docs)
    }

    async fn list_active_children(&self, parent_id: Uuid) -> EngineResult<Vec<ProcessExecution>> {
        let docs: Vec<String> = sqlx::query_scalar(
            "SELECT doc FROM process_executions
             WHERE parent_execution_id = ? AND status IN ('pending', 'running', 'paused')",
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Self::parse_all(&docs)
    }

    async fn list_history(
        &self,
        process_id: Uuid,
        limit: u32,
    ) -> EngineResult<Vec<ProcessExecution>> {
        let docs: Vec<String> = sqlx::query_scalar(
            "SELECT doc FROM process_executions
             WHERE process_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(process_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Self::parse_all(&docs)
    }

    async fn count_active(&self) -> EngineResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM process_executions
             WHERE status IN ('pending', 'running', 'paused')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn count_active_for_process(&self, process_id: Uuid) -> EngineResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM process_executions
             WHERE process_id = ? AND status IN ('pending', 'running', 'paused')",
        )
        .bind(process_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM process_executions
             WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut purged = Vec::with_capacity(ids.len());
        for id in ids {
            sqlx::query("DELETE FROM approval_index WHERE execution_id = ?")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM process_executions WHERE id = ?")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            if let Ok(uuid) = Uuid::parse_str(&id) {
                purged.push(uuid);
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::definition::OnError;
    use crate::domain::models::{
        Approval, ProcessDefinition, StepConfig, StepDefinition, TriggeredBy,
    };
    use crate::infrastructure::database::connection::test_connection;

    fn definition() -> ProcessDefinition {
        let mut def = ProcessDefinition::new_draft("pipeline", "platform", "alice");
        def.steps = vec![StepDefinition {
            id: "a".into(),
            name: "a".into(),
            depends_on: vec![],
            condition: None,
            informed_agents: vec![],
            config: StepConfig::AgentTask {
                agent: "worker".into(),
                message: "m".into(),
                timeout_secs: 60,
                max_cost: None,
                retry: None,
                on_error: OnError::Fail,
            },
        }];
        def.publish().unwrap();
        def
    }

    fn execution(def: &ProcessDefinition) -> ProcessExecution {
        ProcessExecution::new(
            def,
            serde_json::json!({"k": "v"}),
            TriggeredBy::manual("alice"),
            "alice",
        )
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let db = test_connection().await;
        let repo = SqliteExecutionRepository::new(db.pool().clone());
        let def = definition();
        let mut exec = execution(&def);
        exec.begin().unwrap();
        let _ = exec.take_events();

        repo.save(&exec).await.unwrap();
        let loaded = repo.get(exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, exec.id);
        assert_eq!(loaded.status, exec.status);
        assert_eq!(loaded.sequence, exec.sequence);
        assert_eq!(loaded.steps, exec.steps);
    }

    #[tokio::test]
    async fn test_stale_sequence_rejected() {
        let db = test_connection().await;
        let repo = SqliteExecutionRepository::new(db.pool().clone());
        let def = definition();
        let mut exec = execution(&def);
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        let stale = {
            let mut e = exec.clone();
            let _ = e.take_events();
            e
        };
        let _ = exec.take_events();
        repo.save(&exec).await.unwrap();

        // A writer holding an older sequence cannot regress the row.
        let mut old = stale;
        old.sequence = exec.sequence - 1;
        let err = repo.save(&old).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_find_by_approval() {
        let db = test_connection().await;
        let repo = SqliteExecutionRepository::new(db.pool().clone());
        let def = definition();
        let mut exec = execution(&def);
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        let approval = Approval::new(
            exec.id,
            "a",
            vec!["alice".into()],
            Utc::now() + chrono::Duration::hours(1),
        );
        let approval_id = approval.id;
        exec.wait_for_approval("a", approval).unwrap();
        let _ = exec.take_events();
        repo.save(&exec).await.unwrap();

        let found = repo.find_by_approval(approval_id).await.unwrap().unwrap();
        assert_eq!(found.id, exec.id);
        assert!(repo.find_by_approval(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counts_and_listings() {
        let db = test_connection().await;
        let repo = SqliteExecutionRepository::new(db.pool().clone());
        let def = definition();

        let mut running = execution(&def);
        running.begin().unwrap();
        let _ = running.take_events();
        repo.save(&running).await.unwrap();

        let mut done = execution(&def);
        done.begin().unwrap();
        done.start_step("a").unwrap();
        done.complete_step("a", serde_json::json!("out"), 0.1).unwrap();
        done.complete(None).unwrap();
        let _ = done.take_events();
        repo.save(&done).await.unwrap();

        assert_eq!(repo.count_active().await.unwrap(), 1);
        assert_eq!(repo.count_active_for_process(def.id).await.unwrap(), 1);
        assert_eq!(
            repo.list_by_status(&[ExecutionStatus::Running]).await.unwrap().len(),
            1
        );
        assert_eq!(repo.list_history(def.id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_respects_cutoff() {
        let db = test_connection().await;
        let repo = SqliteExecutionRepository::new(db.pool().clone());
        let def = definition();

        let mut done = execution(&def);
        done.begin().unwrap();
        done.start_step("a").unwrap();
        done.complete_step("a", serde_json::json!("out"), 0.0).unwrap();
        done.complete(None).unwrap();
        let _ = done.take_events();
        repo.save(&done).await.unwrap();

        // Cutoff in the past purges nothing.
        let purged = repo
            .purge_terminal_before(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(purged.is_empty());

        // Cutoff in the future takes the terminal execution.
        let purged = repo
            .purge_terminal_before(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, vec![done.id]);
        assert!(repo.get(done.id).await.unwrap().is_none());
    }
}
