//! Agent gateway adapters.

pub mod http;
pub mod mock;

pub use http::{HttpAgentGateway, HttpGatewayConfig};
pub use mock::{MockAgentGateway, MockResponse};
