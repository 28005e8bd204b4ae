//! Proxy outcome taxonomy.
//!
//! Every way a request can fail inside the gateway maps to exactly one
//! variant here, and every variant maps to exactly one HTTP status and
//! stable machine-readable code. Handlers never invent ad-hoc status
//! codes; they return a [`ProxyError`] and let [`IntoResponse`] shape
//! the body.
//!
//! Classification drives the call boundary:
//! - [`ProxyError::is_retryable`] gates the retry loop,
//! - [`ProxyError::counts_as_breaker_failure`] gates circuit-breaker
//!   bookkeeping (upstream 5xx responses are counted separately by the
//!   dispatcher, since they arrive as responses rather than errors).

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use gatehouse_core::HttpMethod;
use serde_json::json;

/// Result alias used throughout the proxy crate.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Everything that can go wrong between accepting a request and
/// returning a response.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProxyError {
    // ── Routing ─────────────────────────────────────────────────────────

    /// No route predicate accepted the request.
    #[error("no route matched {method} {path}")]
    NoRouteMatched { method: HttpMethod, path: String },

    /// The route matched but its upstream pool has no healthy endpoint.
    #[error("no healthy endpoint available for service '{service}'")]
    NoHealthyUpstream { service: String },

    // ── Admission ───────────────────────────────────────────────────────

    /// A rate-limit bucket ran out of tokens.
    #[error("rate limit exceeded for '{key}'")]
    RateLimited { key: String, retry_after: Duration },

    /// The circuit for the selected endpoint is open.
    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String, retry_after: Duration },

    /// Bearer-token validation failed.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    // ── Upstream call ───────────────────────────────────────────────────

    /// The upstream did not produce a response within the deadline.
    #[error("upstream timed out after {elapsed_ms}ms")]
    UpstreamTimeout { elapsed_ms: u64 },

    /// TCP/TLS connection to the upstream could not be established.
    #[error("upstream connection failed: {detail}")]
    UpstreamConnectionFailed { detail: String },

    /// The upstream spoke, but not valid HTTP (or the body stream broke).
    #[error("upstream protocol error: {detail}")]
    UpstreamProtocolError { detail: String },

    // ── Everything else ─────────────────────────────────────────────────

    /// A gateway-side invariant broke. Should not happen in practice.
    #[error("internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Status code and stable error code for this outcome.
    pub fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::NoRouteMatched { .. } => (StatusCode::NOT_FOUND, "NO_ROUTE_MATCHED"),
            ProxyError::NoHealthyUpstream { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_HEALTHY_UPSTREAM")
            }
            ProxyError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            ProxyError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN"),
            ProxyError::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ProxyError::UpstreamTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT"),
            ProxyError::UpstreamConnectionFailed { .. } => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_CONNECTION_FAILED")
            }
            ProxyError::UpstreamProtocolError { .. } => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM_PROTOCOL_ERROR")
            }
            ProxyError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Suggested client back-off, surfaced as a `Retry-After` header.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProxyError::RateLimited { retry_after, .. }
            | ProxyError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether the dispatcher may re-attempt the call on another try.
    ///
    /// Only transport-level failures are safe to retry; admission
    /// rejections and client errors are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamTimeout { .. } | ProxyError::UpstreamConnectionFailed { .. }
        )
    }

    /// Whether this outcome increments the endpoint's circuit breaker.
    ///
    /// Protocol errors stay uncounted: a confused upstream is not the
    /// same signal as an unreachable one.
    pub fn counts_as_breaker_failure(&self) -> bool {
        self.is_retryable()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let retry_after = self.retry_after();
        let mut response = (
            status,
            Json(json!({
                "error": {
                    "code": code,
                    "message": self.to_string(),
                }
            })),
        )
            .into_response();
        if let Some(wait) = retry_after {
            let secs = (wait.as_secs_f64().ceil() as u64).max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_stable_code_and_status() {
        let cases = [
            (
                ProxyError::NoRouteMatched {
                    method: HttpMethod::Get,
                    path: "/x".into(),
                },
                StatusCode::NOT_FOUND,
                "NO_ROUTE_MATCHED",
            ),
            (
                ProxyError::NoHealthyUpstream {
                    service: "orders".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
                "NO_HEALTHY_UPSTREAM",
            ),
            (
                ProxyError::RateLimited {
                    key: "orders:1.2.3.4".into(),
                    retry_after: Duration::from_secs(2),
                },
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
            ),
            (
                ProxyError::CircuitOpen {
                    service: "orders".into(),
                    retry_after: Duration::from_secs(30),
                },
                StatusCode::SERVICE_UNAVAILABLE,
                "CIRCUIT_OPEN",
            ),
            (
                ProxyError::Unauthorized {
                    reason: "missing bearer token".into(),
                },
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
            ),
            (
                ProxyError::UpstreamTimeout { elapsed_ms: 500 },
                StatusCode::GATEWAY_TIMEOUT,
                "UPSTREAM_TIMEOUT",
            ),
            (
                ProxyError::UpstreamConnectionFailed {
                    detail: "refused".into(),
                },
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_CONNECTION_FAILED",
            ),
            (
                ProxyError::UpstreamProtocolError {
                    detail: "bad chunk".into(),
                },
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_PROTOCOL_ERROR",
            ),
            (
                ProxyError::Internal("oops".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
            ),
        ];
        for (err, status, code) in cases {
            let (s, c) = err.parts();
            assert_eq!(s, status, "{err}");
            assert_eq!(c, code, "{err}");
        }
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(ProxyError::UpstreamTimeout { elapsed_ms: 1 }.is_retryable());
        assert!(
            ProxyError::UpstreamConnectionFailed {
                detail: "refused".into()
            }
            .is_retryable()
        );
        assert!(
            !ProxyError::UpstreamProtocolError {
                detail: "garbled".into()
            }
            .is_retryable()
        );
        assert!(
            !ProxyError::RateLimited {
                key: "k".into(),
                retry_after: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(
            !ProxyError::NoHealthyUpstream {
                service: "s".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn protocol_errors_do_not_count_against_the_breaker() {
        assert!(ProxyError::UpstreamTimeout { elapsed_ms: 1 }.counts_as_breaker_failure());
        assert!(
            !ProxyError::UpstreamProtocolError {
                detail: "garbled".into()
            }
            .counts_as_breaker_failure()
        );
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let err = ProxyError::RateLimited {
            key: "k".into(),
            retry_after: Duration::from_millis(1500),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        // 1.5s rounds up to the next whole second.
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from(2u64)
        );
    }
}
