//! Trinity - deep-agent orchestration platform.
//!
//! A long-running service that coordinates containerized LLM agents through
//! an explicit process engine:
//! - versioned process definitions executed as DAGs of typed steps
//! - a coordinator with persist-then-publish event discipline
//! - per-agent execution queues with a single in-flight slot
//! - cron scheduling with store-level fire locks
//! - role-based authorization and an append-only audit log

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{EngineError, EngineResult, ErrorKind};
pub use infrastructure::database::DatabaseConnection;
pub use services::engine::ExecutionEngine;
