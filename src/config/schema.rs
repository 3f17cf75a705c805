//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the service.
///
/// Built once at process start and never mutated afterwards; the server
/// receives it behind an `Arc`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Per-request and per-connection timeouts.
    pub timeouts: TimeoutConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:5000").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5000".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Timeout configuration.
///
/// Unless `shutdown_grace_ms` is set, the write timeout doubles as the
/// shutdown grace period.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed for a client to send a request head, and for the request
    /// body to be read once the head has arrived, in milliseconds.
    pub read_ms: u64,

    /// Time allowed for producing and sending a complete response, in milliseconds.
    pub write_ms: u64,

    /// Time a connection may sit with no request in flight, in milliseconds.
    pub idle_ms: u64,

    /// Grace period for draining on shutdown, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,
}

impl TimeoutConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// Grace period handed to `stop` when draining.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.write_timeout())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: 5_000,
            write_ms: 5_000,
            idle_ms: 5_000,
            shutdown_grace_ms: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line, for log aggregation.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when `RUST_LOG` is unset (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
