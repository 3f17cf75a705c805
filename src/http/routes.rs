//! Route table served by the binary.
//!
//! The lifecycle never looks inside it; any `axum::Router` can take its place.

use axum::routing::get;
use axum::Router;

use crate::http::request;

/// `GET /health` answers `ok`; everything else is `404`.
pub fn default_router() -> Router {
    request::instrument(Router::new().route("/health", get(health)))
}

async fn health() -> &'static str {
    "ok"
}
