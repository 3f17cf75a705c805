//! Shared utilities for lifecycle integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::routing::{get, post};
use axum::Router;
use service_bootstrap::lifecycle::Phase;
use service_bootstrap::{HttpServer, ServerConfig, ServerHandle};
use tokio::sync::watch;

/// Config bound to an ephemeral loopback port.
pub fn local_config(read_ms: u64, write_ms: u64, idle_ms: u64) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.timeouts.read_ms = read_ms;
    config.timeouts.write_ms = write_ms;
    config.timeouts.idle_ms = idle_ms;
    config
}

/// A loopback address that was free a moment ago.
pub fn free_addr() -> SocketAddr {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

/// `/fast` answers at once, `/slow` after `delay`, `/stream` sends five chunks
/// `chunk_gap` apart, `POST /echo` returns the request body.
pub fn test_router(delay: Duration, chunk_gap: Duration) -> Router {
    Router::new()
        .route("/fast", get(|| async { "fast" }))
        .route("/echo", post(|body: String| async move { body }))
        .route(
            "/slow",
            get(move || async move {
                tokio::time::sleep(delay).await;
                "done"
            }),
        )
        .route(
            "/stream",
            get(move || async move {
                let chunks = futures_util::stream::unfold(0u32, move |n| async move {
                    if n == 5 {
                        return None;
                    }
                    tokio::time::sleep(chunk_gap).await;
                    Some((Ok::<_, std::io::Error>(format!("chunk{n}\n")), n + 1))
                });
                Body::from_stream(chunks)
            }),
        )
}

/// Start a server and wait until it is accepting.
pub async fn start_server(config: ServerConfig, router: Router) -> (ServerHandle, SocketAddr) {
    let handle = HttpServer::new(Arc::new(config), router).start();
    let addr = handle.ready().await.expect("server failed to bind");
    (handle, addr)
}

/// Client without connection pooling or proxies.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Fire a GET in the background and return its body.
pub fn spawn_get(
    addr: SocketAddr,
    path: &str,
) -> tokio::task::JoinHandle<Result<String, reqwest::Error>> {
    let url = format!("http://{addr}{path}");
    tokio::spawn(async move { client().get(url).send().await?.text().await })
}

pub async fn wait_for_phase(phase: &mut watch::Receiver<Phase>, target: Phase) {
    tokio::time::timeout(Duration::from_secs(5), phase.wait_for(|p| *p == target))
        .await
        .expect("phase not reached in time")
        .expect("coordinator went away");
}
