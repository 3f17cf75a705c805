//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, connection cap within what the
//!   limiter can hold)
//! - Check that addresses parse before anything tries to bind them

use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::schema::ServerConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid bind address {0:?}")]
    BindAddress(String),

    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("listener.max_connections must be at most {max}, got {value}")]
    TooManyConnections { value: usize, max: usize },
}

/// Validate a configuration, collecting every problem rather than stopping at the first.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    match config.listener.max_connections {
        0 => errors.push(ValidationError::ZeroMaxConnections),
        value if value > Semaphore::MAX_PERMITS => {
            errors.push(ValidationError::TooManyConnections {
                value,
                max: Semaphore::MAX_PERMITS,
            })
        }
        _ => {}
    }

    for (name, value) in [
        ("read_ms", config.timeouts.read_ms),
        ("write_ms", config.timeouts.write_ms),
        ("idle_ms", config.timeouts.idle_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }
    if config.timeouts.shutdown_grace_ms == Some(0) {
        errors.push(ValidationError::ZeroTimeout("shutdown_grace_ms"));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
