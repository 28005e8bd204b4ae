//! The upstream HTTP client.
//!
//! One forwarding attempt: build the upstream URL from the (possibly
//! rewritten) path plus the original query string, copy headers minus
//! the hop-by-hop set, attach the body, and stream the answer back.
//! Bodies flow through in both directions; the forwarder never buffers.
//!
//! Transport failures map onto the proxy taxonomy here so the
//! dispatcher can reason about retries and breaker accounting without
//! touching `reqwest` types:
//!
//! | Failure | Outcome |
//! |---------|---------|
//! | attempt deadline exceeded | `UpstreamTimeout` |
//! | TCP/TLS connect failed | `UpstreamConnectionFailed` |
//! | anything else transport-shaped | `UpstreamProtocolError` |
//!
//! An upstream 5xx is not an error at this layer: it is a response,
//! returned as such, and judged at the call boundary.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::HeaderMap;
use bytes::Bytes;
use gatehouse_core::EndpointAddr;
use reqwest::Method;

use crate::context::{ProxyResponse, RequestContext};
use crate::error::{ProxyError, ProxyResult};

/// Request headers owned by the gateway; never copied verbatim.
const SKIPPED_REQUEST_HEADERS: [&str; 6] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "x-forwarded-for",
    "x-request-id",
];

/// Body for one forwarding attempt.
///
/// Retry-enabled routes buffer once and hand out cheap `Bytes` clones
/// per attempt; everything else streams straight through and is
/// consumed by its single attempt.
#[derive(Debug)]
pub enum AttemptBody {
    Buffered(Bytes),
    Streamed(Body),
}

/// Reverse-proxy client shared by every route.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// Builds the shared client. Per-attempt deadlines are passed on
    /// each call, so the client itself carries no global timeout.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Performs one attempt against `endpoint`, bounded by `remaining`.
    pub async fn send(
        &self,
        ctx: &RequestContext,
        endpoint: &EndpointAddr,
        body: AttemptBody,
        remaining: Duration,
    ) -> ProxyResult<ProxyResponse> {
        let method = Method::from_bytes(ctx.head.method.as_str().as_bytes())
            .map_err(|err| ProxyError::Internal(format!("method conversion: {err}")))?;

        let mut url = format!("{}{}", endpoint.base_url(), ctx.head.path);
        if let Some(query) = &ctx.raw_query {
            if !query.is_empty() {
                url.push('?');
                url.push_str(query);
            }
        }

        let mut request = self.client.request(method, &url).timeout(remaining);
        for (name, value) in &ctx.head.headers {
            if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            request = request.header(name, value);
        }
        request = request.header("x-request-id", &ctx.id);
        if let Some(ip) = &ctx.client_ip {
            let forwarded = match ctx.head.header("x-forwarded-for") {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip.clone(),
            };
            request = request.header("x-forwarded-for", forwarded);
        }
        request = match body {
            AttemptBody::Buffered(bytes) => request.body(bytes),
            AttemptBody::Streamed(stream) => {
                request.body(reqwest::Body::wrap_stream(stream.into_data_stream()))
            }
        };

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|err| classify(&err, remaining))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = response.status();
        let mut headers = HeaderMap::with_capacity(response.headers().len());
        for (name, value) in response.headers() {
            // The gateway's own server frames the response body.
            if matches!(name.as_str(), "connection" | "transfer-encoding") {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        tracing::debug!(
            request_id = %ctx.id,
            endpoint = %endpoint,
            status = status.as_u16(),
            latency_ms,
            "upstream responded"
        );

        Ok(ProxyResponse {
            status,
            headers,
            body: Body::from_stream(response.bytes_stream()),
            upstream: Some(endpoint.clone()),
            latency_ms,
        })
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: &reqwest::Error, remaining: Duration) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout {
            elapsed_ms: remaining.as_millis() as u64,
        }
    } else if err.is_connect() {
        ProxyError::UpstreamConnectionFailed {
            detail: err.to_string(),
        }
    } else {
        ProxyError::UpstreamProtocolError {
            detail: err.to_string(),
        }
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use gatehouse_core::{HttpMethod, RequestHead};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    async fn mirror_handler(req: axum::extract::Request) -> impl IntoResponse {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let headers: HashMap<String, String> = req
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();
        let body = axum::body::to_bytes(req.into_body(), 1024 * 1024)
            .await
            .unwrap_or_default();
        Json(serde_json::json!({
            "method": method,
            "uri": uri,
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
    }

    async fn spawn_app(app: axum::Router) -> EndpointAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        EndpointAddr::new(bound.ip().to_string(), bound.port())
    }

    async fn mirror() -> EndpointAddr {
        spawn_app(axum::Router::new().fallback(mirror_handler)).await
    }

    async fn body_json(resp: ProxyResponse) -> Value {
        let bytes = axum::body::to_bytes(resp.body, 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn ctx(method: HttpMethod, path: &str) -> RequestContext {
        RequestContext::new(RequestHead::new(method, path))
    }

    #[tokio::test]
    async fn forwards_method_path_and_query() {
        let endpoint = mirror().await;
        let ctx = ctx(HttpMethod::Get, "/orders/42").with_raw_query("page=2&full");
        let resp = Forwarder::new()
            .send(
                &ctx,
                &endpoint,
                AttemptBody::Buffered(Bytes::new()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.upstream.as_ref(), Some(&endpoint));
        let seen = body_json(resp).await;
        assert_eq!(seen["method"], "GET");
        assert_eq!(seen["uri"], "/orders/42?page=2&full");
    }

    #[tokio::test]
    async fn stamps_request_id_and_forwarded_for() {
        let endpoint = mirror().await;
        let ctx = RequestContext::new(
            RequestHead::new(HttpMethod::Get, "/x")
                .with_header("x-forwarded-for", "203.0.113.7")
                .with_header("x-request-id", "spoofed")
                .with_header("x-custom", "kept"),
        )
        .with_client_ip("10.0.0.1");

        let resp = Forwarder::new()
            .send(
                &ctx,
                &endpoint,
                AttemptBody::Buffered(Bytes::new()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let seen = body_json(resp).await;

        // The gateway's id wins over anything the client sent.
        assert_eq!(seen["headers"]["x-request-id"], ctx.id.as_str());
        assert_eq!(seen["headers"]["x-forwarded-for"], "203.0.113.7, 10.0.0.1");
        assert_eq!(seen["headers"]["x-custom"], "kept");
    }

    #[tokio::test]
    async fn request_bodies_pass_through() {
        let endpoint = mirror().await;
        let ctx = ctx(HttpMethod::Post, "/orders");
        let resp = Forwarder::new()
            .send(
                &ctx,
                &endpoint,
                AttemptBody::Streamed(Body::from("{\"sku\":\"a-1\"}")),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let seen = body_json(resp).await;
        assert_eq!(seen["body"], "{\"sku\":\"a-1\"}");
    }

    #[tokio::test]
    async fn upstream_5xx_is_a_response_not_an_error() {
        let endpoint = spawn_app(
            axum::Router::new().fallback(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .await;
        let resp = Forwarder::new()
            .send(
                &ctx(HttpMethod::Get, "/x"),
                &endpoint,
                AttemptBody::Buffered(Bytes::new()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let endpoint = spawn_app(axum::Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            StatusCode::OK
        }))
        .await;
        let err = Forwarder::new()
            .send(
                &ctx(HttpMethod::Get, "/x"),
                &endpoint,
                AttemptBody::Buffered(Bytes::new()),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamTimeout { elapsed_ms: 50 }));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_failure() {
        // Bind then drop to find a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);
        let endpoint = EndpointAddr::new(bound.ip().to_string(), bound.port());

        let err = Forwarder::new()
            .send(
                &ctx(HttpMethod::Get, "/x"),
                &endpoint,
                AttemptBody::Buffered(Bytes::new()),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnectionFailed { .. }));
    }
}
