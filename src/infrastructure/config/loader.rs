//! Configuration loader with hierarchical merging.

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use super::Config;
use crate::domain::models::Role;
use crate::services::agent_queue::OverflowPolicy;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(#[from] Box<figment::Error>),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid queue overflow policy: {0}. Must be one of: queue, reject, delay")]
    InvalidOverflowPolicy(String),

    #[error("Invalid queue depth: 0. Must be at least 1")]
    InvalidQueueDepth,

    #[error("Invalid role '{role}' for api key identity {user}")]
    InvalidApiKeyRole { user: String, role: String },

    #[error("Invalid recovery max_age_hours: {0}. Must be positive")]
    InvalidMaxAge(i64),
}

/// Loads configuration with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Built-in defaults
    /// 2. `trinity.yaml` in the working directory (or the given path)
    /// 3. Environment variables prefixed `TRINITY_` (sections split by `__`,
    ///    e.g. `TRINITY_SERVER__PORT=9090`)
    pub fn load(path: Option<&str>) -> Result<Config, ConfigError> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.unwrap_or("trinity.yaml")))
            .merge(Env::prefixed("TRINITY_").split("__"))
            .extract()
            .map_err(Box::new)?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.trim().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }
        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        match config.logging.format.as_str() {
            "json" | "pretty" => {}
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
        if config.queue.depth == 0 {
            return Err(ConfigError::InvalidQueueDepth);
        }
        if OverflowPolicy::from_str(&config.queue.overflow).is_none() {
            return Err(ConfigError::InvalidOverflowPolicy(config.queue.overflow.clone()));
        }
        if config.recovery.max_age_hours <= 0 {
            return Err(ConfigError::InvalidMaxAge(config.recovery.max_age_hours));
        }
        for identity in config.server.api_keys.values() {
            if Role::from_str(&identity.role).is_none() {
                return Err(ConfigError::InvalidApiKeyRole {
                    user: identity.user_id.clone(),
                    role: identity.role.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(ConfigLoader::validate(&config).is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.max_concurrent_executions, 50);
        assert_eq!(config.scheduler.retention_days, 90);
    }

    #[test]
    fn test_invalid_overflow_rejected() {
        let mut config = Config::default();
        config.queue.overflow = "explode".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidOverflowPolicy(_))
        ));
    }

    #[test]
    fn test_invalid_api_key_role_rejected() {
        let mut config = Config::default();
        config.server.api_keys.insert(
            "key-1".to_string(),
            super::super::ApiKeyIdentity {
                user_id: "svc".to_string(),
                team: "infra".to_string(),
                role: "superuser".to_string(),
            },
        );
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidApiKeyRole { .. })
        ));
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TRINITY_SERVER__PORT", "9191");
            jail.set_env("TRINITY_QUEUE__OVERFLOW", "reject");
            let config = ConfigLoader::load(None).expect("load");
            assert_eq!(config.server.port, 9191);
            assert_eq!(config.queue.overflow, "reject");
            Ok(())
        });
    }
}
