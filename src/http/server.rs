//! HTTP server lifecycle.
//!
//! # Responsibilities
//! - Bind the listener on a background task so `start` never blocks
//! - Run the accept loop with one task per connection
//! - Serve HTTP/1.1 and HTTP/2 through the request processor
//! - Enforce read, write and idle timeouts
//! - Drain on `stop`, force-close connections once the grace period is spent
//!
//! # State Transitions
//! ```text
//! Created → Running:        socket bound and accepting
//! Created → Stopped:        bind failed
//! Running → ShuttingDown:   stop() called
//! ShuttingDown → Stopped:   every connection closed, or grace period elapsed
//! ```
//!
//! # Design Decisions
//! - State lives in a watch channel; transitions are compare-and-set under its lock
//! - The accept task owns every connection task in a `JoinSet`, so aborting
//!   them at the deadline closes their sockets before `stop` returns
//! - Connections are watched by hyper-util's `GracefulShutdown`: idle ones close
//!   as soon as a drain starts, requests already being processed may finish
//!   until the deadline and are cut off after it
//! - A single drain runs per server, on its own task; `stop` only waits for its
//!   result, so dropping a `stop` future never abandons a drain halfway

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use axum::Router;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::{GracefulShutdown, Watcher};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::http::processor::{self, RequestTimeouts};
use crate::net::{
    ConnectionActivity, ConnectionGuard, ConnectionPermit, ConnectionTracker, Listener,
    ListenerError,
};
use crate::observability::metrics;

/// Pause after a failed accept (e.g. file descriptor exhaustion) before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Lifecycle state of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Start issued, socket not bound yet.
    Created,
    /// Socket bound and accepting connections.
    Running,
    /// No longer accepting; in-flight work is draining.
    ShuttingDown,
    /// Socket and every connection closed.
    Stopped,
}

/// Errors visible to whoever owns the server.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// `stop` was called before the server finished starting.
    #[error("Server has not finished starting")]
    NotStarted,

    /// Connections were still open when the grace period ran out; they were closed.
    #[error("Shutdown timed out after {grace:?} with {remaining} connection(s) still open")]
    ShutdownTimedOut { grace: Duration, remaining: u64 },
}

/// HTTP server serving a request processor.
pub struct HttpServer {
    config: Arc<ServerConfig>,
    processor: Router,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration and processor.
    pub fn new(config: Arc<ServerConfig>, processor: Router) -> Self {
        Self { config, processor }
    }

    /// Start serving in the background and return immediately.
    ///
    /// Must be called from within a Tokio runtime. Bind failures are reported
    /// through [`ServerHandle::ready`]. Dropping the handle does not stop the server.
    pub fn start(self) -> ServerHandle {
        let (state, _) = watch::channel(ServerState::Created);
        let (drain, _) = watch::channel(false);
        let (force_close, _) = watch::channel(false);
        let (stop_outcome, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            config: self.config,
            state,
            local_addr: OnceLock::new(),
            bind_error: OnceLock::new(),
            drain,
            force_close,
            serve_task: Mutex::new(None),
            stop_outcome,
            connections: ConnectionTracker::new(),
        });

        let guard = BindGuard {
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(serve(guard, self.processor));
        *shared
            .serve_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        ServerHandle { shared }
    }
}

struct Shared {
    config: Arc<ServerConfig>,
    state: watch::Sender<ServerState>,
    local_addr: OnceLock<SocketAddr>,
    bind_error: OnceLock<ServerError>,
    /// Raised once: stop accepting, close idle connections.
    drain: watch::Sender<bool>,
    /// Raised once: abort every remaining connection.
    force_close: watch::Sender<bool>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    /// Result of the drain, published once it has finished.
    stop_outcome: watch::Sender<Option<Result<(), ServerError>>>,
    connections: ConnectionTracker,
}

/// Handle to a started server.
///
/// Clones refer to the same instance.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.shared.state.subscribe()
    }

    /// Address the socket is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> u64 {
        self.shared.connections.active_count()
    }

    /// Wait for the outcome of binding: the bound address, or the bind error.
    pub async fn ready(&self) -> Result<SocketAddr, ServerError> {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s != ServerState::Created).await;

        if let Some(err) = self.shared.bind_error.get() {
            return Err(err.clone());
        }
        self.local_addr().ok_or(ServerError::NotStarted)
    }

    /// Stop accepting, drain in-flight requests, and wait at most `grace`.
    ///
    /// Idempotent: concurrent and repeated calls share the first call's drain
    /// and its result. The drain runs on its own task, so cancelling a call
    /// does not cancel the drain. Returns [`ServerError::NotStarted`] while
    /// the socket is not bound yet, without affecting the server.
    pub async fn stop(&self, grace: Duration) -> Result<(), ServerError> {
        let shared = &self.shared;

        let mut observed = ServerState::Created;
        let began = shared.state.send_if_modified(|state| {
            observed = *state;
            if *state == ServerState::Running {
                *state = ServerState::ShuttingDown;
                true
            } else {
                false
            }
        });

        if began {
            tokio::spawn(drain(Arc::clone(shared), grace));
        } else {
            match observed {
                ServerState::Created => return Err(ServerError::NotStarted),
                ServerState::Stopped => {
                    // Never ran: there is no drain to wait for.
                    if let Some(err) = shared.bind_error.get() {
                        return Err(err.clone());
                    }
                }
                ServerState::Running | ServerState::ShuttingDown => {}
            }
        }

        let mut outcome = shared.stop_outcome.subscribe();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone(),
            Err(_) => None,
        };
        result.unwrap_or(Ok(()))
    }
}

/// Drain task: wait for the serve task within `grace`, then force-close.
async fn drain(shared: Arc<Shared>, grace: Duration) {
    let started = Instant::now();
    tracing::info!(
        grace_ms = grace.as_millis() as u64,
        open_connections = shared.connections.active_count(),
        "Draining connections"
    );
    shared.drain.send_replace(true);

    let task = shared
        .serve_task
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    let result = match task {
        None => Ok(()),
        Some(mut task) => match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => {
                log_task_exit(joined);
                Ok(())
            }
            Err(_) => {
                let remaining = shared.connections.active_count();
                tracing::warn!(
                    remaining,
                    grace_ms = grace.as_millis() as u64,
                    "Grace period elapsed, closing remaining connections"
                );
                shared.force_close.send_replace(true);
                log_task_exit(task.await);
                Err(ServerError::ShutdownTimedOut { grace, remaining })
            }
        },
    };

    shared.state.send_replace(ServerState::Stopped);
    let outcome = if result.is_ok() { "drained" } else { "timed_out" };
    metrics::record_shutdown(outcome, started.elapsed());
    tracing::info!(
        outcome,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Server stopped"
    );
    shared.stop_outcome.send_replace(Some(result));
}

/// Reports a failed start if the serve task goes away before binding,
/// including when it panics or is cancelled before it first runs.
struct BindGuard {
    shared: Arc<Shared>,
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.state.send_if_modified(|state| {
            if *state != ServerState::Created {
                return false;
            }
            let _ = shared.bind_error.set(ServerError::Bind {
                address: shared.config.listener.bind_address.clone(),
                source: Arc::new(std::io::Error::other(
                    "server task exited before binding",
                )),
            });
            *state = ServerState::Stopped;
            true
        });
    }
}

/// Background task: bind, accept until drained, then wait for connections.
async fn serve(bind_guard: BindGuard, processor: Router) {
    let shared = Arc::clone(&bind_guard.shared);
    let bound = Listener::bind(&shared.config.listener)
        .await
        .and_then(|listener| {
            let addr = listener.local_addr().map_err(ListenerError::Bind)?;
            Ok((listener, addr))
        });

    let (listener, local_addr) = match bound {
        Ok(bound) => bound,
        Err(err) => {
            let error = bind_error(&shared.config.listener.bind_address, err);
            tracing::error!(error = %error, "Failed to run server");
            let _ = shared.bind_error.set(error);
            shared.state.send_replace(ServerState::Stopped);
            return;
        }
    };

    let _ = shared.local_addr.set(local_addr);
    shared.state.send_if_modified(|state| {
        if *state == ServerState::Created {
            *state = ServerState::Running;
            true
        } else {
            false
        }
    });
    tracing::info!(address = %local_addr, "Server running");

    let builder = connection_builder(&shared.config);
    let timeouts = RequestTimeouts {
        read: shared.config.timeouts.read_timeout(),
        write: shared.config.timeouts.write_timeout(),
    };
    let graceful = GracefulShutdown::new();
    let mut drain = shared.drain.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = flag_raised(&mut drain) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr, permit)) => {
                    let guard = shared.connections.track();
                    let span = tracing::debug_span!(
                        "connection",
                        connection_id = %guard.id(),
                        peer_addr = %peer_addr,
                    );
                    let task = ConnectionTask {
                        stream,
                        builder: builder.clone(),
                        processor: processor.clone(),
                        timeouts,
                        idle_timeout: shared.config.timeouts.idle_timeout(),
                        watcher: graceful.watcher(),
                        _permit: permit,
                        _guard: guard,
                    };
                    connections.spawn(task.run().instrument(span));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_task_exit(joined);
            }
        }
    }

    drop(listener);
    tracing::info!(
        address = %local_addr,
        open_connections = shared.connections.active_count(),
        "Stopped accepting connections"
    );

    let mut force_close = shared.force_close.subscribe();
    let forced = tokio::select! {
        _ = graceful.shutdown() => false,
        _ = flag_raised(&mut force_close) => true,
    };
    if forced {
        connections.shutdown().await;
    } else {
        join_all(&mut connections).await;
    }
}

/// One accepted connection and everything needed to serve it.
struct ConnectionTask {
    stream: TcpStream,
    builder: auto::Builder<TokioExecutor>,
    processor: Router,
    timeouts: RequestTimeouts,
    idle_timeout: Duration,
    watcher: Watcher,
    _permit: ConnectionPermit,
    _guard: ConnectionGuard,
}

impl ConnectionTask {
    async fn run(self) {
        let activity = Arc::new(ConnectionActivity::new());
        let service = {
            let activity = Arc::clone(&activity);
            let router = self.processor;
            let timeouts = self.timeouts;
            service_fn(move |request| {
                processor::process(router.clone(), request, timeouts, Arc::clone(&activity))
            })
        };

        let conn = self
            .builder
            .serve_connection_with_upgrades(TokioIo::new(self.stream), service);
        let conn = self.watcher.watch(conn);
        tokio::pin!(conn);

        let mut next_idle_check = self.idle_timeout;
        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(err) = result {
                        tracing::debug!(error = %err, "Connection ended with error");
                    }
                    return;
                }
                _ = tokio::time::sleep(next_idle_check) => match activity.idle_for() {
                    Some(idle) if idle >= self.idle_timeout => {
                        // Nothing in flight, so dropping the connection loses no work.
                        tracing::debug!(
                            idle_ms = idle.as_millis() as u64,
                            "Closing idle connection"
                        );
                        return;
                    }
                    Some(idle) => next_idle_check = self.idle_timeout - idle,
                    None => next_idle_check = self.idle_timeout,
                },
            }
        }
    }
}

/// The read timeout bounds the HTTP/1 request head here; request bodies, on
/// either protocol, are bounded in `processor`.
fn connection_builder(config: &ServerConfig) -> auto::Builder<TokioExecutor> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(config.timeouts.read_timeout());
    builder.http2().timer(TokioTimer::new());
    builder
}

/// Resolves once the flag is raised, or its sender is gone.
async fn flag_raised(flag: &mut watch::Receiver<bool>) {
    loop {
        let raised = *flag.borrow_and_update();
        if raised || flag.changed().await.is_err() {
            return;
        }
    }
}

async fn join_all(connections: &mut JoinSet<()>) {
    while let Some(joined) = connections.join_next().await {
        log_task_exit(joined);
    }
}

fn log_task_exit(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => {}
        Err(err) => tracing::error!(error = %err, "Connection task panicked"),
    }
}

fn bind_error(address: &str, err: ListenerError) -> ServerError {
    let source = match err {
        ListenerError::Bind(e) | ListenerError::Accept(e) => e,
        ListenerError::Closed => std::io::Error::other("connection limiter closed"),
    };
    ServerError::Bind {
        address: address.to_string(),
        source: Arc::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> Arc<ServerConfig> {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        Arc::new(config)
    }

    #[tokio::test]
    async fn ready_reports_bound_address() {
        let handle = HttpServer::new(local_config(), Router::new()).start();
        assert_eq!(handle.state(), ServerState::Created);

        let addr = handle.ready().await.unwrap();
        assert_eq!(handle.state(), ServerState::Running);
        assert_eq!(handle.local_addr(), Some(addr));
        assert_ne!(addr.port(), 0);

        handle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn stop_after_bind_failure_returns_bind_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "256.0.0.1:80".into();
        let handle = HttpServer::new(Arc::new(config), Router::new()).start();

        let err = handle.ready().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { ref address, .. } if address == "256.0.0.1:80"));
        assert_eq!(handle.state(), ServerState::Stopped);
        assert!(matches!(
            handle.stop(Duration::from_secs(1)).await,
            Err(ServerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn serve_task_gone_before_binding_is_a_failed_start() {
        let handle = HttpServer::new(local_config(), Router::new()).start();
        // Not polled yet on the current-thread runtime: cancel it outright.
        handle
            .shared
            .serve_task
            .lock()
            .unwrap()
            .take()
            .unwrap()
            .abort();

        let err = tokio::time::timeout(Duration::from_secs(1), handle.ready())
            .await
            .expect("ready must not wait forever")
            .unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert_eq!(handle.state(), ServerState::Stopped);
        assert!(matches!(
            handle.stop(Duration::from_secs(1)).await,
            Err(ServerError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_connection_cap_fails_start() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        config.listener.max_connections = usize::MAX >> 2;
        let handle = HttpServer::new(Arc::new(config), Router::new()).start();

        let err = tokio::time::timeout(Duration::from_secs(1), handle.ready())
            .await
            .expect("ready must not wait forever")
            .unwrap_err();
        match err {
            ServerError::Bind { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidInput)
            }
            other => panic!("expected bind failure, got {other:?}"),
        }
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn flag_raised_sees_value_set_before_waiting() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_millis(100), flag_raised(&mut rx))
            .await
            .unwrap();
    }

    #[test]
    fn bind_error_keeps_address_and_cause() {
        let err = bind_error(
            "127.0.0.1:5000",
            ListenerError::Bind(std::io::Error::from(std::io::ErrorKind::AddrInUse)),
        );
        assert!(err.to_string().starts_with("Failed to bind 127.0.0.1:5000"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
