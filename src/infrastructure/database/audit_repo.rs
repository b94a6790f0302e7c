//! SQLite implementation of the append-only audit repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::definition::DataClassification;
use crate::domain::models::{AuditEntry, AuditFilter};
use crate::domain::ports::AuditRepository;

#[derive(Clone)]
pub struct SqliteAuditRepository {
    pool: SqlitePool,
}

impl SqliteAuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn classification_from_str(s: &str) -> DataClassification {
    match s {
        "public" => DataClassification::Public,
        "confidential" => DataClassification::Confidential,
        "restricted" => DataClassification::Restricted,
        _ => DataClassification::Internal,
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> EngineResult<AuditEntry> {
    let id: String = row.try_get("id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let details: String = row.try_get("details")?;
    let classification: String = row.try_get("data_classification")?;
    Ok(AuditEntry {
        id: Uuid::parse_str(&id)
            .map_err(|e| EngineError::Database(format!("corrupt audit id: {e}")))?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| EngineError::Database(format!("corrupt audit timestamp: {e}")))?,
        actor: row.try_get("actor")?,
        action: row.try_get("action")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        details: serde_json::from_str(&details)?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        data_classification: classification_from_str(&classification),
        retention_days: row.try_get::<i64, _>("retention_days")? as u32,
    })
}

fn filter_clause(filter: &AuditFilter) -> (String, Vec<String>) {
    let mut clause = String::from(" WHERE 1=1");
    let mut bindings = Vec::new();
    if let Some(actor) = &filter.actor {
        clause.push_str(" AND actor = ?");
        bindings.push(actor.clone());
    }
    if let Some(action) = &filter.action {
        clause.push_str(" AND action = ?");
        bindings.push(action.clone());
    }
    if let Some(resource_type) = &filter.resource_type {
        clause.push_str(" AND resource_type = ?");
        bindings.push(resource_type.clone());
    }
    if let Some(resource_id) = &filter.resource_id {
        clause.push_str(" AND resource_id = ?");
        bindings.push(resource_id.clone());
    }
    if let Some(since) = &filter.since {
        clause.push_str(" AND timestamp >= ?");
        bindings.push(since.to_rfc3339());
    }
    if let Some(until) = &filter.until {
        clause.push_str(" AND timestamp < ?");
        bindings.push(until.to_rfc3339());
    }
    (clause, bindings)
}

#[async_trait]
impl AuditRepository for SqliteAuditRepository {
    async fn append(&self, entry: &AuditEntry) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO audit_log
             (id, timestamp, actor, action, resource_type, resource_id, details,
              ip, user_agent, data_classification, retention_days)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(entry.data_classification.as_str())
        .bind(i64::from(entry.retention_days))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<AuditEntry>> {
        let row = sqlx::query("SELECT * FROM audit_log WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn list(
        &self,
        filter: &AuditFilter,
        limit: u32,
        offset: u32,
    ) -> EngineResult<Vec<AuditEntry>> {
        let (clause, bindings) = filter_clause(filter);
        let sql = format!(
            "SELECT * FROM audit_log{clause} ORDER BY timestamp DESC LIMIT ? OFFSET ?"
        );
        let mut query = sqlx::query(&sql);
        for binding in &bindings {
            query = query.bind(binding);
        }
        query = query.bind(i64::from(limit)).bind(i64::from(offset));
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn count(&self, filter: &AuditFilter) -> EngineResult<u64> {
        let (clause, bindings) = filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM audit_log{clause}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for binding in &bindings {
            query = query.bind(binding);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count as u64)
    }
}
