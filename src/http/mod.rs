//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper connection, HTTP/1.1 or HTTP/2, timeouts, drain)
//!     → processor.rs (write timeout, in-flight tracking)
//!     → request processor (axum Router; routes.rs for the binary)
//!     → request.rs layers (request ID, trace span)
//!     → Send to client
//! ```

pub mod processor;
pub mod request;
pub mod routes;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::{HttpServer, ServerError, ServerHandle, ServerState};
