//! Termination signal sources.
//!
//! # Responsibilities
//! - Abstract "terminate requested" behind [`SignalSource`]
//! - OS signals: SIGINT everywhere, SIGTERM on Unix
//! - Composite source resolving on the first of several
//!
//! # Design Decisions
//! - A source only notifies; it never drives shutdown itself
//! - No timeouts and no retries: a source waits until its event happens
//! - A handler that cannot be installed is logged and never fires

use std::future::pending;

use futures_util::future::{select_all, BoxFuture};

/// A request to terminate. Carries nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSignal;

/// Something that eventually asks the process to terminate.
pub trait SignalSource: Send + Sync {
    /// Resolve once termination is requested.
    fn await_termination(&self) -> BoxFuture<'_, ShutdownSignal>;
}

impl<S: SignalSource + ?Sized> SignalSource for Box<S> {
    fn await_termination(&self) -> BoxFuture<'_, ShutdownSignal> {
        (**self).await_termination()
    }
}

/// SIGINT (Ctrl+C) and, on Unix, SIGTERM.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignals;

impl SignalSource for OsSignals {
    fn await_termination(&self) -> BoxFuture<'_, ShutdownSignal> {
        Box::pin(async {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for SIGINT");
                    pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sig) => {
                        sig.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to listen for SIGTERM");
                        pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = pending::<()>();

            tokio::select! {
                () = ctrl_c => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
                () = terminate => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
            }

            ShutdownSignal
        })
    }
}

/// Resolves when the first of its sources does. With no sources it never resolves.
#[derive(Default)]
pub struct AnyOf {
    sources: Vec<Box<dyn SignalSource>>,
}

impl AnyOf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source.
    pub fn with(mut self, source: impl SignalSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl SignalSource for AnyOf {
    fn await_termination(&self) -> BoxFuture<'_, ShutdownSignal> {
        Box::pin(async move {
            if self.sources.is_empty() {
                return pending().await;
            }
            let waits = self.sources.iter().map(|source| source.await_termination());
            let (signal, _index, _rest) = select_all(waits).await;
            signal
        })
    }
}
