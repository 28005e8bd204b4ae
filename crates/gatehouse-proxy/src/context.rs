//! Per-request state threaded through the filter pipeline.
//!
//! A [`RequestContext`] is created once per inbound request and handed
//! to every filter hook; request-phase hooks may mutate it (rewrite the
//! path, attach a principal) and the dispatcher reads the final shape
//! when forwarding. A [`ProxyResponse`] wraps whatever came back from
//! the upstream (or an error rendering) so response-phase hooks can
//! annotate it before it leaves the gateway.

use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use gatehouse_core::{EndpointAddr, PathParams, RequestHead};
use uuid::Uuid;

use crate::error::ProxyError;

/// Mutable request state owned by the dispatcher for the lifetime of
/// one proxied call.
#[derive(Debug)]
pub struct RequestContext {
    /// Correlation id, generated at ingress and echoed on the response.
    pub id: String,
    /// The matchable view of the request. Filters mutate this in place;
    /// the forwarder sends whatever is here after the request phase.
    pub head: RequestHead,
    /// Raw query string as received, preserved byte-for-byte for the
    /// upstream URL. `head.query` holds the decoded view for matching.
    pub raw_query: Option<String>,
    /// Captures extracted by the winning route's path predicate.
    pub path_params: PathParams,
    /// Id of the route that matched.
    pub route_id: String,
    /// Service the route forwards to.
    pub service: String,
    /// Peer address of the client connection, when known.
    pub client_ip: Option<String>,
    /// Authenticated subject, set by the auth filter when present.
    pub principal: Option<String>,
    /// Ingress timestamp; the total deadline is measured from here.
    pub started_at: Instant,
}

impl RequestContext {
    /// Creates a context with a fresh correlation id.
    pub fn new(head: RequestHead) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            head,
            raw_query: None,
            path_params: PathParams::new(),
            route_id: String::new(),
            service: String::new(),
            client_ip: None,
            principal: None,
            started_at: Instant::now(),
        }
    }

    /// Attaches the winning route's identity and captures.
    pub fn with_route(mut self, route_id: &str, service: &str, params: PathParams) -> Self {
        self.route_id = route_id.to_string();
        self.service = service.to_string();
        self.path_params = params;
        self
    }

    /// Records the client socket address.
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// Preserves the original query string for upstream forwarding.
    pub fn with_raw_query(mut self, raw: impl Into<String>) -> Self {
        self.raw_query = Some(raw.into());
        self
    }

    /// Best identity we have for the calling client.
    ///
    /// Prefers proxy-provided headers over the socket address so the
    /// gateway keys rate limits correctly behind another LB:
    /// `x-forwarded-for` (first hop), then `x-real-ip`, then the peer
    /// address, then a shared anonymous bucket.
    pub fn client_key(&self) -> String {
        if let Some(forwarded) = self.head.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(real) = self.head.header("x-real-ip") {
            return real.to_string();
        }
        self.client_ip
            .clone()
            .unwrap_or_else(|| "anonymous".to_string())
    }

    /// Milliseconds since ingress.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// A response making its way back out of the gateway.
///
/// Bodies are kept as streams; the gateway never buffers an upstream
/// response.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    /// Endpoint that produced this response, when one was contacted.
    pub upstream: Option<EndpointAddr>,
    /// Time spent in the winning upstream attempt.
    pub latency_ms: u64,
}

impl ProxyResponse {
    /// Renders a gateway-generated error as a response so the response
    /// phase of the filter chain can still run over it.
    pub fn from_error(err: &ProxyError) -> Self {
        let (status, code) = err.parts();
        let retry_after = err.retry_after();
        let mut response = (
            status,
            axum::Json(serde_json::json!({
                "error": { "code": code, "message": err.to_string() }
            })),
        )
            .into_response();
        if let Some(wait) = retry_after {
            let secs = (wait.as_secs_f64().ceil() as u64).max(1);
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, HeaderValue::from(secs));
        }
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body,
            upstream: None,
            latency_ms: 0,
        }
    }

    /// Sets a header, overwriting any existing value. Invalid names or
    /// values are dropped with a warning rather than failing the
    /// response.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => {
                tracing::warn!(header = name, "dropping invalid response header");
            }
        }
    }

    /// Final assembly into an Axum response.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

// ===== Tests =====
