//! Lifecycle coordinator.
//!
//! # States
//! ```text
//! Idle → Starting:        run() starts the server in the background
//! Starting → Serving:     the server reports its socket bound
//! Starting → Terminated:  bind failed (fatal)
//! Serving → Draining:     first termination signal, exactly once
//! Draining → Terminated:  stop() returned, drained or timed out
//! ```
//!
//! # Design Decisions
//! - The coordinator owns the config and the server handle for the whole run
//! - One wait for a signal, then one bounded stop; nothing is retried
//! - The grace period is the request write timeout
//! - A timed-out drain is reported but still counts as a completed run

use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::http::{HttpServer, ServerError};
use crate::lifecycle::signals::SignalSource;

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Serving,
    Draining,
    Terminated,
}

/// How a completed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every in-flight request finished within the grace period.
    Drained,
    /// The grace period ran out and remaining connections were closed.
    TimedOut,
}

/// A run that could not complete.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Startup failed: {0}")]
    Startup(#[source] ServerError),

    #[error("Shutdown failed: {0}")]
    Shutdown(#[source] ServerError),
}

/// Drives one server through start, serve and drain.
pub struct Coordinator {
    config: Arc<ServerConfig>,
    processor: Router,
    phase: watch::Sender<Phase>,
}

impl Coordinator {
    pub fn new(config: ServerConfig, processor: Router) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            config: Arc::new(config),
            processor,
            phase,
        }
    }

    /// Watch phase changes.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn current_phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Move from `from` to `to`; `false` if the coordinator was not in `from`.
    fn advance(&self, from: Phase, to: Phase) -> bool {
        let moved = self.phase.send_if_modified(|phase| {
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(from = ?from, to = ?to, "Lifecycle transition");
        }
        moved
    }

    /// Serve until `signals` requests termination, then drain.
    pub async fn run<S: SignalSource>(self, signals: S) -> Result<Outcome, LifecycleError> {
        self.advance(Phase::Idle, Phase::Starting);
        tracing::info!(
            bind_address = %self.config.listener.bind_address,
            max_connections = self.config.listener.max_connections,
            read_timeout_ms = self.config.timeouts.read_ms,
            write_timeout_ms = self.config.timeouts.write_ms,
            idle_timeout_ms = self.config.timeouts.idle_ms,
            shutdown_grace_ms = self.config.timeouts.shutdown_grace().as_millis() as u64,
            "Starting server"
        );

        let handle = HttpServer::new(Arc::clone(&self.config), self.processor.clone()).start();

        let addr = match handle.ready().await {
            Ok(addr) => addr,
            Err(err) => {
                tracing::error!(error = %err, "Server failed to start");
                self.phase.send_replace(Phase::Terminated);
                return Err(LifecycleError::Startup(err));
            }
        };
        self.advance(Phase::Starting, Phase::Serving);
        tracing::info!(address = %addr, "Server running...");

        signals.await_termination().await;
        if !self.advance(Phase::Serving, Phase::Draining) {
            tracing::debug!("Drain already initiated, ignoring signal");
        }

        let grace = self.config.timeouts.shutdown_grace();
        let result = handle.stop(grace).await;
        self.phase.send_replace(Phase::Terminated);

        match result {
            Ok(()) => {
                tracing::info!("Server shutdown gracefully");
                Ok(Outcome::Drained)
            }
            Err(err @ ServerError::ShutdownTimedOut { .. }) => {
                tracing::warn!(error = %err, "Server shutdown timed out");
                Ok(Outcome::TimedOut)
            }
            Err(err) => {
                tracing::error!(error = %err, "Server shutdown failed");
                Err(LifecycleError::Shutdown(err))
            }
        }
    }
}
