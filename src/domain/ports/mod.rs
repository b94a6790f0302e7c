//! Ports: trait seams between the domain and the outside world.

pub mod agent_gateway;
pub mod audit_repository;
pub mod definition_repository;
pub mod execution_repository;
pub mod notification_sink;
pub mod output_store;
pub mod schedule_repository;

pub use agent_gateway::{AgentGateway, AgentTaskRequest, AgentTaskResult, Availability};
pub use audit_repository::AuditRepository;
pub use definition_repository::ProcessDefinitionRepository;
pub use execution_repository::ProcessExecutionRepository;
pub use notification_sink::{DeliveryReceipt, NotificationSink};
pub use output_store::OutputStore;
pub use schedule_repository::ScheduleRepository;
