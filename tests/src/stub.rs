//! Scripted upstream servers.
//!
//! A [`StubUpstream`] is a real axum server on a loopback port with one
//! fixed behavior and a hit counter, which is all a gateway test needs
//! to observe routing, retries, and breaker short-circuits.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use gatehouse_core::EndpointAddr;
use serde_json::json;
use tokio::net::TcpListener;

/// What the stub does with every request.
#[derive(Debug, Clone, Copy)]
pub enum StubBehavior {
    /// 200 with a JSON mirror of method, path, query, headers, body.
    Echo { name: &'static str },
    /// Always this status, empty body.
    Status(u16),
    /// 500 for the first `failures` requests, then 200.
    FailFirst { failures: usize },
    /// Sleep, then 200.
    Delay { delay: Duration },
}

/// One loopback upstream with a request counter.
pub struct StubUpstream {
    addr: EndpointAddr,
    hits: Arc<AtomicUsize>,
}

impl StubUpstream {
    pub async fn spawn(behavior: StubBehavior) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().fallback(move |request: Request| {
            let hits = Arc::clone(&counter);
            async move { respond(behavior, &hits, request).await }
        });
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("stub should bind");
        let addr = listener.local_addr().expect("stub has a local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            addr: EndpointAddr::new(addr.ip().to_string(), addr.port()),
            hits,
        }
    }

    pub async fn echo(name: &'static str) -> Self {
        Self::spawn(StubBehavior::Echo { name }).await
    }

    pub async fn status(code: u16) -> Self {
        Self::spawn(StubBehavior::Status(code)).await
    }

    pub async fn fail_first(failures: usize) -> Self {
        Self::spawn(StubBehavior::FailFirst { failures }).await
    }

    pub async fn delay(delay: Duration) -> Self {
        Self::spawn(StubBehavior::Delay { delay }).await
    }

    pub fn addr(&self) -> EndpointAddr {
        self.addr.clone()
    }

    /// Requests observed so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn respond(behavior: StubBehavior, hits: &Arc<AtomicUsize>, request: Request) -> Response {
    let n = hits.fetch_add(1, Ordering::SeqCst);
    match behavior {
        StubBehavior::Echo { name } => {
            let (parts, body) = request.into_parts();
            let bytes = axum::body::to_bytes(body, 1 << 20).await.unwrap_or_default();
            let headers: HashMap<String, String> = parts
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            Json(json!({
                "name": name,
                "method": parts.method.as_str(),
                "path": parts.uri.path(),
                "query": parts.uri.query(),
                "headers": headers,
                "body": String::from_utf8_lossy(&bytes),
            }))
            .into_response()
        }
        StubBehavior::Status(code) => status_response(code),
        StubBehavior::FailFirst { failures } => {
            if n < failures {
                status_response(500)
            } else {
                status_response(200)
            }
        }
        StubBehavior::Delay { delay } => {
            tokio::time::sleep(delay).await;
            status_response(200)
        }
    }
}

fn status_response(code: u16) -> Response {
    StatusCode::from_u16(code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}
