//! Composition root: explicit wiring of repositories, services, sinks, and
//! the HTTP surface. No ambient globals; everything is a constructor
//! parameter.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::ports::{
    AgentGateway, AuditRepository, NotificationSink, OutputStore, ProcessDefinitionRepository,
    ProcessExecutionRepository, ScheduleRepository,
};
use crate::infrastructure::config::Config;
use crate::infrastructure::database::{
    DatabaseConnection, SqliteAuditRepository, SqliteDefinitionRepository,
    SqliteExecutionRepository, SqliteOutputStore, SqliteScheduleRepository,
};
use crate::infrastructure::gateway::{HttpAgentGateway, HttpGatewayConfig};
use crate::infrastructure::http::{self, AppState};
use crate::infrastructure::notify::TracingNotificationSink;
use crate::services::agent_queue::AgentExecutionQueue;
use crate::services::authorization::AuthorizationService;
use crate::services::engine::ExecutionEngine;
use crate::services::event_bus::{EventBus, EventBusConfig};
use crate::services::handlers::StepHandlers;
use crate::services::limits::ExecutionLimitService;
use crate::services::recovery::{RecoveryReport, RecoveryService};
use crate::services::scheduler::SchedulerService;
use crate::services::sinks;

/// The assembled application.
pub struct App {
    pub state: AppState,
    pub scheduler: Arc<SchedulerService>,
    pub recovery: RecoveryService,
}

/// Wire the whole system from configuration.
pub async fn build(config: &Config) -> Result<App> {
    let database_url = format!("sqlite:{}", config.database.path);
    let db = DatabaseConnection::new(&database_url, config.database.max_connections)
        .await
        .context("failed to connect to database")?;
    db.migrate().await.context("failed to run database migrations")?;

    let definitions: Arc<dyn ProcessDefinitionRepository> =
        Arc::new(SqliteDefinitionRepository::new(db.pool().clone()));
    let executions: Arc<dyn ProcessExecutionRepository> =
        Arc::new(SqliteExecutionRepository::new(db.pool().clone()));
    let schedules: Arc<dyn ScheduleRepository> =
        Arc::new(SqliteScheduleRepository::new(db.pool().clone()));
    let audit: Arc<dyn AuditRepository> = Arc::new(SqliteAuditRepository::new(db.pool().clone()));
    let outputs: Arc<dyn OutputStore> = Arc::new(SqliteOutputStore::new(db.pool().clone()));

    let gateway: Arc<dyn AgentGateway> = Arc::new(
        HttpAgentGateway::new(HttpGatewayConfig {
            base_url: config.gateway.base_url.clone(),
            connect_timeout: Duration::from_secs(config.gateway.connect_timeout_secs),
        })
        .context("failed to build agent gateway client")?,
    );
    let notifications: Arc<dyn NotificationSink> = Arc::new(TracingNotificationSink);

    let bus = Arc::new(EventBus::new(EventBusConfig::default()));
    let queue = Arc::new(AgentExecutionQueue::new(gateway.clone(), config.queue_config()));
    let limits = Arc::new(ExecutionLimitService::new(executions.clone(), config.limit_config()));
    let handlers = StepHandlers::new(queue, notifications);
    let engine = ExecutionEngine::new(
        definitions.clone(),
        executions.clone(),
        outputs.clone(),
        handlers,
        bus.clone(),
        limits,
    );

    sinks::spawn_audit_sink(&bus, audit.clone());
    sinks::spawn_awareness_sink(&bus, executions.clone(), definitions.clone(), gateway);
    sinks::spawn_parent_resume_sink(&bus, executions.clone(), engine.clone());

    let scheduler = Arc::new(SchedulerService::new(
        schedules.clone(),
        executions.clone(),
        outputs,
        engine.clone(),
        bus.clone(),
        config.scheduler_config(),
    ));
    let recovery = RecoveryService::new(executions.clone(), definitions.clone(), engine.clone());
    let authz = Arc::new(AuthorizationService::new(audit.clone()));

    let state = AppState {
        engine,
        definitions,
        executions,
        schedule_repo: schedules,
        scheduler: scheduler.clone(),
        audit,
        authz,
        bus,
        api_keys: Arc::new(config.server.api_keys.clone()),
        recovery_report: Arc::new(RwLock::new(None)),
        recovery_in_progress: Arc::new(AtomicBool::new(false)),
    };

    Ok(App { state, scheduler, recovery })
}

/// `trinity serve`: recover interrupted executions, start the scheduler,
/// then serve HTTP until shutdown.
pub async fn run_server(config: Config) -> Result<()> {
    let app = build(&config).await?;

    app.state.recovery_in_progress.store(true, Ordering::SeqCst);
    let report = app
        .recovery
        .run(&config.recovery_config(false))
        .await
        .context("startup recovery failed")?;
    *app.state.recovery_report.write().await = Some(report);
    app.state.recovery_in_progress.store(false, Ordering::SeqCst);

    let scheduler_handle = app.scheduler.clone().start();

    let result = http::serve(&config.server, app.state.clone()).await;

    app.scheduler.stop();
    let _ = scheduler_handle.await;
    info!("shutdown complete");
    result
}

/// `trinity recover [--dry-run]`: one recovery pass, report to stdout.
pub async fn run_recovery(config: Config, dry_run: bool) -> Result<RecoveryReport> {
    let app = build(&config).await?;
    let report = app.recovery.run(&config.recovery_config(dry_run)).await?;
    Ok(report)
}
