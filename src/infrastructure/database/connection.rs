//! SQLite connection pool and in-code schema migrations.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::domain::errors::{EngineError, EngineResult};

/// Connection pool wrapper with WAL mode and embedded migrations.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Open (creating if missing) the database at `database_url`.
    pub async fn new(database_url: &str, max_connections: u32) -> EngineResult<Self> {
        ensure_database_directory(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| EngineError::Database(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the schema. Statements are idempotent.
    pub async fn migrate(&self) -> EngineResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema up to date");
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS process_definitions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        status TEXT NOT NULL,
        owner_team TEXT NOT NULL,
        created_at TEXT NOT NULL,
        doc TEXT NOT NULL,
        UNIQUE (name, version)
    )",
    "CREATE INDEX IF NOT EXISTS idx_definitions_name ON process_definitions (name)",
    "CREATE INDEX IF NOT EXISTS idx_definitions_status ON process_definitions (status)",
    "CREATE TABLE IF NOT EXISTS process_executions (
        id TEXT PRIMARY KEY,
        process_id TEXT NOT NULL,
        status TEXT NOT NULL,
        owner_team TEXT NOT NULL,
        owner_user TEXT NOT NULL,
        parent_execution_id TEXT,
        sequence INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        updated_at TEXT NOT NULL,
        doc TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_executions_status ON process_executions (status)",
    "CREATE INDEX IF NOT EXISTS idx_executions_process ON process_executions (process_id)",
    "CREATE INDEX IF NOT EXISTS idx_executions_team ON process_executions (owner_team)",
    "CREATE INDEX IF NOT EXISTS idx_executions_updated ON process_executions (updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_executions_parent ON process_executions (parent_execution_id)",
    "CREATE TABLE IF NOT EXISTS approval_index (
        approval_id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS schedules (
        id TEXT PRIMARY KEY,
        process_id TEXT NOT NULL,
        process_name TEXT NOT NULL,
        cron TEXT NOT NULL,
        timezone TEXT NOT NULL,
        enabled INTEGER NOT NULL,
        last_fired_at TEXT,
        next_fire_at TEXT,
        owner_user TEXT NOT NULL,
        created_at TEXT NOT NULL,
        lock_token TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_schedules_enabled ON schedules (enabled)",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id TEXT PRIMARY KEY,
        timestamp TEXT NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        details TEXT NOT NULL,
        ip TEXT,
        user_agent TEXT,
        data_classification TEXT NOT NULL,
        retention_days INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_log (resource_type, resource_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log (actor)",
    "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log (timestamp)",
    "CREATE TABLE IF NOT EXISTS step_outputs (
        execution_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        content_type TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (execution_id, step_id)
    )",
];

fn ensure_database_directory(database_url: &str) -> EngineResult<()> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Database(format!("cannot create {parent:?}: {e}")))?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_connection() -> DatabaseConnection {
    let dir = std::env::temp_dir().join(format!("trinity-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let url = format!("sqlite:{}", dir.join("test.db").display());
    let db = DatabaseConnection::new(&url, 2).await.expect("connect");
    db.migrate().await.expect("migrate");
    db
}
