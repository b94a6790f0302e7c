//! Configuration model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::services::agent_queue::{OverflowPolicy, QueueConfig};
use crate::services::limits::LimitConfig;
use crate::services::recovery::RecoveryConfig;
use crate::services::scheduler::SchedulerConfig;

mod loader;
pub use loader::{ConfigError, ConfigLoader};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub engine: EngineSection,
    pub queue: QueueSection,
    pub scheduler: SchedulerSection,
    pub recovery: RecoverySection,
    pub gateway: GatewaySection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "trinity.db".to_string(), max_connections: 5 }
    }
}

/// Identity bound to a static API key. Authentication proper happens
/// upstream; keys are for service-to-service callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyIdentity {
    pub user_id: String,
    pub team: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Bearer api-key -> identity.
    pub api_keys: HashMap<String, ApiKeyIdentity>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: true,
            api_keys: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_concurrent_executions: u32,
    pub default_max_instances: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self { max_concurrent_executions: 50, default_max_instances: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub depth: usize,
    /// One of `queue`, `reject`, `delay`.
    pub overflow: String,
    pub queue_timeout_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { depth: 16, overflow: "queue".to_string(), queue_timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_ms: u64,
    pub jitter_max_ms: u64,
    pub retention_days: u32,
    pub maintenance_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            jitter_max_ms: 500,
            retention_days: 90,
            maintenance_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_age_hours: i64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self { max_age_hours: 24 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub base_url: String,
    pub connect_timeout_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self { base_url: "http://127.0.0.1:9100".to_string(), connect_timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// When set, also write JSON logs to daily-rotated files here.
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string(), log_dir: None }
    }
}

impl Config {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            depth: self.queue.depth,
            overflow: OverflowPolicy::from_str(&self.queue.overflow)
                .unwrap_or(OverflowPolicy::Queue),
            queue_timeout: Duration::from_secs(self.queue.queue_timeout_secs),
        }
    }

    pub fn limit_config(&self) -> LimitConfig {
        LimitConfig {
            max_concurrent_executions: self.engine.max_concurrent_executions,
            default_max_instances: self.engine.default_max_instances,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_ms: self.scheduler.tick_interval_ms,
            jitter_max_ms: self.scheduler.jitter_max_ms,
            retention_days: self.scheduler.retention_days,
            maintenance_interval_secs: self.scheduler.maintenance_interval_secs,
        }
    }

    pub fn recovery_config(&self, dry_run: bool) -> RecoveryConfig {
        RecoveryConfig { max_age_hours: self.recovery.max_age_hours, dry_run }
    }
}
