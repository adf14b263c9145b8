//! Round-robin reverse proxy in front of the workers.
//!
//! Every request, regardless of path or method, is forwarded to the next
//! worker port in rotation. The balancer never inspects bodies and never
//! talks to the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{
        HeaderName, StatusCode,
        header::{CONNECTION, CONTENT_TYPE, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE},
    },
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;

/// Same cap as axum's `DefaultBodyLimit`, which workers enforce.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Headers that describe the client connection, not the request.
const HOP_BY_HOP: [HeaderName; 6] = [HOST, CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE];

/// Cycles through worker ports in a fixed order.
#[derive(Debug)]
pub struct RoundRobin {
    ports: Vec<u16>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// `None` when there is nothing to rotate over.
    pub fn new(ports: Vec<u16>) -> Option<Self> {
        if ports.is_empty() {
            return None;
        }
        Some(Self {
            ports,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Advance the rotation and return the chosen port.
    pub fn next_port(&self) -> u16 {
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.ports[turn % self.ports.len()]
    }
}

#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error("failed to read request body: {0}")]
    Body(axum::Error),
    #[error("Request body too large")]
    BodyTooLarge,
    #[error("worker request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("worker response has no content-type")]
    MissingContentType,
}

impl ForwardError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<axum::Error> for ForwardError {
    fn from(e: axum::Error) -> Self {
        let inner = e.into_inner();
        if inner.is::<LengthLimitError>() {
            Self::BodyTooLarge
        } else {
            Self::Body(axum::Error::new(inner))
        }
    }
}

pub struct Balancer {
    upstream_host: String,
    rotation: RoundRobin,
    client: reqwest::Client,
}

impl Balancer {
    pub fn new(upstream_host: impl Into<String>, rotation: RoundRobin) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            upstream_host: upstream_host.into(),
            rotation,
            client,
        })
    }

    pub fn routes(self: Arc<Self>) -> Router {
        Router::new().fallback(forward).with_state(self)
    }

    async fn forward(&self, request: Request) -> Result<Response, ForwardError> {
        let port = self.rotation.next_port();
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}:{}{}", self.upstream_host, port, path);
        tracing::debug!(method = %parts.method, %url, "Dispatching request");

        let body = axum::body::to_bytes(body, MAX_BODY_BYTES).await?;
        let mut headers = parts.headers;
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let content_type = upstream
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .ok_or(ForwardError::MissingContentType)?;

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        response.headers_mut().insert(CONTENT_TYPE, content_type);
        Ok(response)
    }
}

async fn forward(State(balancer): State<Arc<Balancer>>, request: Request) -> Response {
    match balancer.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Failed to forward request");
            (
                e.status(),
                [(CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
                .into_response()
        }
    }
}
