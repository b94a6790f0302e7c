//! SQLite implementation of the schedule repository.
//!
//! One row per schedule. Firing claims the row with a compare-and-set on
//! `lock_token`, so concurrent schedulers cannot double-fire a tick.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::Schedule;
use crate::domain::ports::ScheduleRepository;

#[derive(Clone)]
pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_timestamp(value: Option<String>) -> EngineResult<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| EngineError::Database(format!("corrupt timestamp '{s}': {e}")))
        })
        .transpose()
}

fn row_to_schedule(row: &sqlx::sqlite::SqliteRow) -> EngineResult<Schedule> {
    let id: String = row.try_get("id")?;
    let process_id: String = row.try_get("process_id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Schedule {
        id: Uuid::parse_str(&id)
            .map_err(|e| EngineError::Database(format!("corrupt schedule id: {e}")))?,
        process_id: Uuid::parse_str(&process_id)
            .map_err(|e| EngineError::Database(format!("corrupt process id: {e}")))?,
        process_name: row.try_get("process_name")?,
        cron: row.try_get("cron")?,
        timezone: row.try_get("timezone")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        last_fired_at: parse_timestamp(row.try_get("last_fired_at")?)?,
        next_fire_at: parse_timestamp(row.try_get("next_fire_at")?)?,
        owner_user: row.try_get("owner_user")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| EngineError::Database(format!("corrupt created_at: {e}")))?,
    })
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    async fn upsert(&self, schedule: &Schedule) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO schedules
             (id, process_id, process_name, cron, timezone, enabled,
              last_fired_at, next_fire_at, owner_user, created_at, lock_token)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
             ON CONFLICT (id) DO UPDATE SET
               cron = excluded.cron,
               timezone = excluded.timezone,
               enabled = excluded.enabled,
               last_fired_at = excluded.last_fired_at,
               next_fire_at = excluded.next_fire_at",
        )
        .bind(schedule.id.to_string())
        .bind(schedule.process_id.to_string())
        .bind(&schedule.process_name)
        .bind(&schedule.cron)
        .bind(&schedule.timezone)
        .bind(i64::from(schedule.enabled))
        .bind(schedule.last_fired_at.map(|t| t.to_rfc3339()))
        .bind(schedule.next_fire_at.map(|t| t.to_rfc3339()))
        .bind(&schedule.owner_user)
        .bind(schedule.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    async fn list(&self) -> EngineResult<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    async fn list_enabled(&self) -> EngineResult<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE enabled = 1 ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    async fn delete(&self, id: Uuid) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound { resource: "schedule", id: id.to_string() });
        }
        Ok(())
    }

    async fn try_lock(&self, id: Uuid, token: &str) -> EngineResult<bool> {
        let result =
            sqlx::query("UPDATE schedules SET lock_token = ? WHERE id = ? AND lock_token IS NULL")
                .bind(token)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock(
        &self,
        id: Uuid,
        token: &str,
        last_fired_at: Option<DateTime<Utc>>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE schedules
             SET lock_token = NULL, last_fired_at = ?, next_fire_at = ?
             WHERE id = ? AND lock_token = ?",
        )
        .bind(last_fired_at.map(|t| t.to_rfc3339()))
        .bind(next_fire_at.map(|t| t.to_rfc3339()))
        .bind(id.to_string())
        .bind(token)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::StateConflict(format!(
                "schedule {id} lock not held with this token"
            )));
        }
        Ok(())
    }
}
