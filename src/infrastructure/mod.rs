//! Infrastructure adapters: persistence, configuration, gateway clients,
//! notification transport, logging, and the HTTP surface.

pub mod config;
pub mod database;
pub mod gateway;
pub mod http;
pub mod logging;
pub mod notify;
pub mod setup;
