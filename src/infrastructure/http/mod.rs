//! HTTP/WebSocket surface: thin command and query handlers over the
//! services.

pub mod approvals;
pub mod audit;
pub mod auth;
pub mod error;
pub mod executions;
pub mod processes;
pub mod schedules;
pub mod server;
pub mod state;
pub mod ws;

pub use error::{ApiError, ApiResult};
pub use server::{build_router, serve};
pub use state::AppState;
