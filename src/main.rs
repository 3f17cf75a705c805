//! Service bootstrap (v1)
//!
//! Binds a TCP listener, serves the route table, and drains gracefully on
//! SIGINT/SIGTERM.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────┐
//!                    │                 SERVICE BOOTSTRAP                 │
//!                    │                                                   │
//!   Client Request   │  ┌─────────┐    ┌─────────┐    ┌──────────────┐  │
//!   ─────────────────┼─▶│   net   │───▶│  http   │───▶│   request    │  │
//!                    │  │listener │    │ server  │    │  processor   │  │
//!                    │  └─────────┘    └────▲────┘    └──────────────┘  │
//!                    │                      │ start / stop(grace)        │
//!                    │               ┌──────┴───────┐   ┌────────────┐  │
//!                    │               │  lifecycle   │◀──│  signals   │◀─┼── SIGINT
//!                    │               │ coordinator  │   │            │  │   SIGTERM
//!                    │               └──────────────┘   └────────────┘  │
//!                    │                                                   │
//!                    │  ┌──────────┐  ┌────────────────┐                 │
//!                    │  │  config  │  │ observability  │                 │
//!                    │  └──────────┘  └────────────────┘                 │
//!                    └──────────────────────────────────────────────────┘
//! ```

use std::process::ExitCode;

use service_bootstrap::http::routes::default_router;
use service_bootstrap::lifecycle::{startup, Coordinator, OsSignals};
use service_bootstrap::observability::{logging, metrics};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match startup::load_config_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("service-bootstrap: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&config.observability) {
        eprintln!("service-bootstrap: failed to initialise logging: {}", e);
    }

    tracing::info!("service-bootstrap v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    "Failed to parse metrics address"
                );
            }
        }
    }

    let coordinator = Coordinator::new(config, default_router());
    let result = coordinator.run(OsSignals).await;

    if result.is_ok() {
        tracing::info!("Shutdown complete");
    }
    ExitCode::from(startup::exit_status(&result))
}
