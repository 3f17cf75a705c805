//! Request dispatch into the request processor.
//!
//! # Responsibilities
//! - Hand each request to the processor (an `axum::Router`)
//! - Bound reading the request body by the read timeout
//! - Bound producing and sending the whole response by the write timeout
//! - Mark the request in flight so the idle timeout leaves the connection alone
//!
//! # Design Decisions
//! - Both deadlines count from the moment the request head has been parsed
//! - A handler that runs past the write deadline fails its service call, which
//!   makes hyper close the connection instead of sending a response
//! - A body still streaming at the write deadline errors out, which aborts the
//!   response and closes the connection (HTTP/2 resets the stream)
//! - The request stays in flight until its response body is finished or dropped
//! - Processor failures are the processor's business: the router is infallible
//!   and turns its own errors into responses

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::Router;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::{Request, Response};
use thiserror::Error;
use tokio::time::{Instant, Sleep};
use tower::ServiceExt;

use crate::net::{ConnectionActivity, InFlightRequest};
use crate::observability::metrics;

/// Failure that ends the connection the request arrived on.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("Request body not received within {0:?}")]
    ReadTimeout(Duration),

    #[error("Response not written within {0:?}")]
    WriteTimeout(Duration),
}

/// Per-request time limits.
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeouts {
    pub read: Duration,
    pub write: Duration,
}

/// Run one request through the processor.
pub async fn process(
    router: Router,
    request: Request<Incoming>,
    timeouts: RequestTimeouts,
    activity: Arc<ConnectionActivity>,
) -> Result<Response<Body>, RequestError> {
    let in_flight = activity.begin_request();
    let started = Instant::now();
    let write_deadline = started + timeouts.write;
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let request = request.map(|body| {
        Body::new(Deadline::new(
            Body::new(body),
            started + timeouts.read,
            RequestError::ReadTimeout(timeouts.read),
        ))
    });

    match tokio::time::timeout_at(write_deadline, router.oneshot(request)).await {
        Ok(Ok(response)) => Ok(response.map(|body| {
            Body::new(
                Deadline::new(
                    body,
                    write_deadline,
                    RequestError::WriteTimeout(timeouts.write),
                )
                .holding(in_flight),
            )
        })),
        Ok(Err(infallible)) => match infallible {},
        Err(_) => {
            tracing::warn!(
                method = %method,
                path = %path,
                timeout_ms = timeouts.write.as_millis() as u64,
                "Request exceeded write timeout, closing connection"
            );
            metrics::record_request_timeout();
            Err(RequestError::WriteTimeout(timeouts.write))
        }
    }
}

/// Body that fails once its deadline passes.
struct Deadline {
    inner: Body,
    expiry: Pin<Box<Sleep>>,
    error: RequestError,
    expired: bool,
    _in_flight: Option<InFlightRequest>,
}

impl Deadline {
    fn new(inner: Body, deadline: Instant, error: RequestError) -> Self {
        Self {
            inner,
            expiry: Box::pin(tokio::time::sleep_until(deadline)),
            error,
            expired: false,
            _in_flight: None,
        }
    }

    /// Keep the request counted as in flight for as long as this body lives.
    fn holding(mut self, in_flight: InFlightRequest) -> Self {
        self._in_flight = Some(in_flight);
        self
    }
}

impl HttpBody for Deadline {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(None);
        }

        if this.expiry.as_mut().poll(cx).is_ready() {
            this.expired = true;
            match this.error {
                RequestError::WriteTimeout(timeout) => {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Response body exceeded write timeout, closing connection"
                    );
                    metrics::record_request_timeout();
                }
                RequestError::ReadTimeout(timeout) => {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Request body exceeded read timeout"
                    );
                }
            }
            return Poll::Ready(Some(Err(axum::Error::new(this.error.clone()))));
        }

        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::to_bytes;
    use futures_util::stream;

    fn trickle(gap: Duration) -> Body {
        Body::from_stream(stream::unfold(0u32, move |n| async move {
            if n == 3 {
                return None;
            }
            tokio::time::sleep(gap).await;
            Some((Ok::<_, std::io::Error>(Bytes::from("x")), n + 1))
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn body_inside_deadline_passes_through() {
        let body = Deadline::new(
            trickle(Duration::from_millis(10)),
            Instant::now() + Duration::from_secs(1),
            RequestError::WriteTimeout(Duration::from_secs(1)),
        );
        let bytes = to_bytes(Body::new(body), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"xxx");
    }

    #[tokio::test(start_paused = true)]
    async fn body_past_deadline_fails() {
        let body = Deadline::new(
            trickle(Duration::from_millis(400)),
            Instant::now() + Duration::from_millis(500),
            RequestError::ReadTimeout(Duration::from_millis(500)),
        );
        let err = to_bytes(Body::new(body), usize::MAX).await.unwrap_err();
        assert!(err.to_string().contains("not received within"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_body_reports_end_of_stream() {
        let mut body = Deadline::new(
            trickle(Duration::from_secs(10)),
            Instant::now() + Duration::from_millis(100),
            RequestError::WriteTimeout(Duration::from_millis(100)),
        );
        let frame = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await;
        assert!(matches!(frame, Some(Err(_))));
        assert!(body.is_end_stream());
        let next = std::future::poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await;
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn response_body_keeps_request_in_flight() {
        let activity = Arc::new(ConnectionActivity::new());
        let body = Deadline::new(
            Body::from("done"),
            Instant::now() + Duration::from_secs(1),
            RequestError::WriteTimeout(Duration::from_secs(1)),
        )
        .holding(activity.begin_request());
        assert_eq!(activity.in_flight(), 1);

        let bytes = to_bytes(Body::new(body), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"done");
        assert_eq!(activity.in_flight(), 0);
    }
}
