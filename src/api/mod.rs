//! Endpoint dispatch over the request pipeline, plus the HTTP server.

pub mod endpoint;
pub mod monitor;
#[cfg(feature = "server")]
pub mod server;

pub use endpoint::{ApiResponse, Endpoint, RequestParams, dispatch};
pub use monitor::{HealthReport, Monitor};
