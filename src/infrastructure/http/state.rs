//! Shared state for the HTTP surface.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::ports::{
    AuditRepository, ProcessDefinitionRepository, ProcessExecutionRepository, ScheduleRepository,
};
use crate::infrastructure::config::ApiKeyIdentity;
use crate::services::authorization::AuthorizationService;
use crate::services::engine::ExecutionEngine;
use crate::services::event_bus::EventBus;
use crate::services::recovery::RecoveryReport;
use crate::services::scheduler::SchedulerService;

/// Everything the handlers need, wired once in the composition root.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub definitions: Arc<dyn ProcessDefinitionRepository>,
    pub executions: Arc<dyn ProcessExecutionRepository>,
    pub schedule_repo: Arc<dyn ScheduleRepository>,
    pub scheduler: Arc<SchedulerService>,
    pub audit: Arc<dyn AuditRepository>,
    pub authz: Arc<AuthorizationService>,
    pub bus: Arc<EventBus>,
    pub api_keys: Arc<HashMap<String, ApiKeyIdentity>>,
    pub recovery_report: Arc<RwLock<Option<RecoveryReport>>>,
    pub recovery_in_progress: Arc<AtomicBool>,
}
