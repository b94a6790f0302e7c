//! Application services.

pub mod agent_queue;
pub mod authorization;
pub mod dependency_resolver;
pub mod engine;
pub mod event_bus;
pub mod expression;
pub mod handlers;
pub mod limits;
pub mod recovery;
pub mod scheduler;
pub mod sinks;

pub use agent_queue::{AgentExecutionQueue, OverflowPolicy, QueueConfig};
pub use authorization::{AccessDecision, AuthScope, AuthorizationService};
pub use dependency_resolver::{DependencyResolver, Readiness};
pub use engine::ExecutionEngine;
pub use event_bus::{EventBus, EventBusConfig};
pub use expression::ExpressionEvaluator;
pub use limits::{ExecutionLimitService, LimitConfig};
pub use recovery::{RecoveryConfig, RecoveryReport, RecoveryService};
pub use scheduler::{SchedulerConfig, SchedulerService};
