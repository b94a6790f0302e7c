//! SQLite persistence adapters.

pub mod audit_repo;
pub mod connection;
pub mod definition_repo;
pub mod execution_repo;
pub mod output_repo;
pub mod schedule_repo;

pub use audit_repo::SqliteAuditRepository;
pub use connection::DatabaseConnection;
pub use definition_repo::SqliteDefinitionRepository;
pub use execution_repo::SqliteExecutionRepository;
pub use output_repo::SqliteOutputStore;
pub use schedule_repo::SqliteScheduleRepository;
