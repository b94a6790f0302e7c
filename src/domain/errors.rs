//! Domain errors for the Trinity process engine.
//!
//! Every failure in the system is classified into one of the kinds in
//! [`ErrorKind`]; retry policies, audit records, and HTTP status mapping
//! all key off that classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed taxonomy of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input malformed or violates invariants. Never retried.
    Validation,
    /// Caller lacks permission or scope.
    AuthorizationDenied,
    /// Resource unknown.
    NotFound,
    /// Operation incompatible with current status.
    StateConflict,
    /// Expression failed to parse.
    Expression,
    /// Agent call or approval exceeded its limit. Retryable for agent calls.
    Timeout,
    /// Downstream rate limit. Retryable.
    RateLimit,
    /// Target agent not running or not accepting work. Retryable.
    AgentUnavailable,
    /// Queue overflow. Retried with a short delay without consuming an attempt.
    QueueFull,
    /// Cumulative cost exceeds the cap. Fatal for the execution.
    BudgetExceeded,
    /// Gateway had no matching route and no default. Fatal for the step.
    NoMatchingRoute,
    /// Operation aborted by explicit cancel.
    Cancelled,
    /// Uncategorized. Retried once, then fatal.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::AuthorizationDenied => "authorization_denied",
            Self::NotFound => "not_found",
            Self::StateConflict => "state_conflict",
            Self::Expression => "expression_error",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::AgentUnavailable => "agent_unavailable",
            Self::QueueFull => "queue_full",
            Self::BudgetExceeded => "budget_exceeded",
            Self::NoMatchingRoute => "no_matching_route",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal_error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(Self::Validation),
            "authorization_denied" => Some(Self::AuthorizationDenied),
            "not_found" => Some(Self::NotFound),
            "state_conflict" => Some(Self::StateConflict),
            "expression_error" => Some(Self::Expression),
            "timeout" => Some(Self::Timeout),
            "rate_limit" => Some(Self::RateLimit),
            "agent_unavailable" => Some(Self::AgentUnavailable),
            "queue_full" => Some(Self::QueueFull),
            "budget_exceeded" => Some(Self::BudgetExceeded),
            "no_matching_route" => Some(Self::NoMatchingRoute),
            "cancelled" => Some(Self::Cancelled),
            "internal_error" => Some(Self::Internal),
            _ => None,
        }
    }

    /// Whether this kind is transient and retried by default when no
    /// explicit `retryable_kinds` list is configured on the step.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::AgentUnavailable | Self::Internal
        )
    }

    /// Kinds that terminate the whole execution regardless of retry policy.
    pub fn is_fatal_for_execution(&self) -> bool {
        matches!(self, Self::BudgetExceeded | Self::Cancelled)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scope of an execution-limit rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Global,
    PerProcess,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::PerProcess => "per_process",
        }
    }
}

/// Errors produced by the engine and its services.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authorization denied: {reason}")]
    AuthorizationDenied { reason: String },

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Execution queue full for agent {agent}")]
    QueueFull { agent: String },

    #[error("Budget exceeded: cost {attempted:.4} over cap {limit:.4}")]
    BudgetExceeded { limit: f64, attempted: f64 },

    #[error("No matching gateway route for step {step}")]
    NoMatchingRoute { step: String },

    #[error("Execution limit reached ({} scope): {limit} running", scope.as_str())]
    LimitExceeded { scope: LimitScope, limit: u32 },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Classify into the closed taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AuthorizationDenied { .. } => ErrorKind::AuthorizationDenied,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::StateConflict(_) => ErrorKind::StateConflict,
            Self::Expression(_) => ErrorKind::Expression,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RateLimit(_) | Self::LimitExceeded { .. } => ErrorKind::RateLimit,
            Self::AgentUnavailable(_) => ErrorKind::AgentUnavailable,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::NoMatchingRoute { .. } => ErrorKind::NoMatchingRoute,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) | Self::Database(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::AuthorizationDenied,
            ErrorKind::NotFound,
            ErrorKind::StateConflict,
            ErrorKind::Expression,
            ErrorKind::Timeout,
            ErrorKind::RateLimit,
            ErrorKind::AgentUnavailable,
            ErrorKind::QueueFull,
            ErrorKind::BudgetExceeded,
            ErrorKind::NoMatchingRoute,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::RateLimit.is_transient());
        assert!(ErrorKind::AgentUnavailable.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
        assert!(!ErrorKind::BudgetExceeded.is_transient());
    }

    #[test]
    fn test_engine_error_classification() {
        assert_eq!(
            EngineError::QueueFull { agent: "writer".into() }.kind(),
            ErrorKind::QueueFull
        );
        assert_eq!(
            EngineError::Database("locked".into()).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            EngineError::LimitExceeded { scope: LimitScope::Global, limit: 50 }.kind(),
            ErrorKind::RateLimit
        );
    }
}
