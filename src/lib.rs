//! Network service bootstrap: bind, serve a pluggable router, drain on signal.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::ServerConfig;
pub use http::{HttpServer, ServerError, ServerHandle, ServerState};
pub use lifecycle::{Coordinator, Outcome, Phase, Shutdown, SignalSource};
