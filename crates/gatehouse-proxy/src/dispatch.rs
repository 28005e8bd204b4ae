//! The request lifecycle.
//!
//! One dispatch walks the whole pipeline:
//!
//! ```text
//!   resolve route ──> request hooks ──> attempt loop ──> response hooks
//!        │                  │                │
//!        404            reject (401,     select endpoint,
//!                        429, ...)       breaker admission,
//!                                        forward, classify,
//!                                        maybe retry
//! ```
//!
//! The attempt loop owns the call-boundary policy. A single deadline
//! (`CallPolicy::timeout`) covers every attempt and every backoff
//! sleep; each attempt gets whatever budget remains. Retries happen
//! only for retryable outcomes (upstream 5xx, timeouts, connect
//! failures), only within the attempt budget, and only when the verb is
//! idempotent or the route opted in for the rest.
//!
//! Bodies: a route with retries buffers the request body once (capped)
//! so later attempts can replay it; single-attempt routes stream
//! straight through. Response bodies always stream, with the
//! endpoint's in-flight count held until the stream finishes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use gatehouse_core::{RequestHead, RetrySpec};

use crate::balancer::InFlightGuard;
use crate::context::{ProxyResponse, RequestContext};
use crate::discovery::UpstreamDirectory;
use crate::error::{ProxyError, ProxyResult};
use crate::forward::{AttemptBody, Forwarder};
use crate::pipeline::SharedStores;
use crate::table::{CompiledRoute, RouteTableHandle};

/// Largest request body a retry-enabled route will buffer for replay.
const MAX_RETRY_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Where attempt bodies come from.
enum BodySource {
    /// Buffered once; every attempt clones cheaply.
    Buffered(Bytes),
    /// Streaming passthrough, consumable exactly once.
    Once(Option<Body>),
}

/// Executes requests against the current route table.
#[derive(Debug)]
pub struct Dispatcher {
    table: Arc<RouteTableHandle>,
    directory: Arc<UpstreamDirectory>,
    stores: Arc<SharedStores>,
    forwarder: Forwarder,
}

impl Dispatcher {
    pub fn new(
        table: Arc<RouteTableHandle>,
        directory: Arc<UpstreamDirectory>,
        stores: Arc<SharedStores>,
    ) -> Self {
        Self {
            table,
            directory,
            stores,
            forwarder: Forwarder::new(),
        }
    }

    pub fn table(&self) -> &RouteTableHandle {
        &self.table
    }

    pub fn directory(&self) -> &UpstreamDirectory {
        &self.directory
    }

    pub fn stores(&self) -> &Arc<SharedStores> {
        &self.stores
    }

    /// Runs one request to completion and renders the outcome.
    pub async fn dispatch(
        &self,
        head: RequestHead,
        raw_query: Option<String>,
        client_ip: Option<String>,
        body: Body,
    ) -> Response {
        let table = self.table.snapshot();
        let Some((route, params)) = table.resolve(&head) else {
            let err = ProxyError::NoRouteMatched {
                method: head.method,
                path: head.path.clone(),
            };
            tracing::warn!(method = %head.method, path = %head.path, "no route matched");
            let mut response = ProxyResponse::from_error(&err);
            response.set_header("x-gateway-version", &table.version().to_string());
            return response.into_response();
        };

        let mut ctx = RequestContext::new(head).with_route(route.id(), &route.spec.service, params);
        if let Some(query) = raw_query {
            ctx = ctx.with_raw_query(query);
        }
        if let Some(ip) = client_ip {
            ctx = ctx.with_client_ip(ip);
        }
        let inbound_path = ctx.head.path.clone();
        tracing::debug!(
            request_id = %ctx.id,
            route = %ctx.route_id,
            method = %ctx.head.method,
            path = %inbound_path,
            "→ dispatching"
        );

        let run = route.chain.run_request(&mut ctx).await;
        let result = match run.rejection {
            Some(err) => Err(err),
            None => self.call_upstream(&route, &ctx, body).await,
        };

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.id,
                    route = %ctx.route_id,
                    error = %err,
                    "request failed"
                );
                ProxyResponse::from_error(&err)
            }
        };
        response.set_header("x-request-id", &ctx.id);
        response.set_header("x-gateway-route", &ctx.route_id);

        route.chain.run_response(&ctx, &mut response, run.completed).await;

        tracing::info!(
            request_id = %ctx.id,
            method = %ctx.head.method,
            path = %inbound_path,
            route = %ctx.route_id,
            status = response.status.as_u16(),
            upstream = response.upstream.as_ref().map(ToString::to_string).unwrap_or_default(),
            latency_ms = ctx.elapsed_ms(),
            "← request completed"
        );
        response.into_response()
    }

    /// The attempt loop: select, admit, forward, classify, maybe retry.
    async fn call_upstream(
        &self,
        route: &CompiledRoute,
        ctx: &RequestContext,
        body: Body,
    ) -> ProxyResult<ProxyResponse> {
        let policy = route.chain.policy();
        let deadline = ctx.started_at + policy.timeout;
        let retry = policy
            .retry
            .as_ref()
            .filter(|r| r.max_attempts > 1)
            .filter(|r| ctx.head.method.is_idempotent() || r.retry_non_idempotent);
        let max_attempts = retry.map_or(1, |r| r.max_attempts);

        let mut source = if max_attempts > 1 {
            match axum::body::to_bytes(body, MAX_RETRY_BODY_BYTES).await {
                Ok(bytes) => BodySource::Buffered(bytes),
                Err(err) => {
                    return Err(ProxyError::Internal(format!(
                        "buffering request body for retry: {err}"
                    )));
                }
            }
        } else {
            BodySource::Once(Some(body))
        };

        let Some(upstream) = self.directory.service(&ctx.service) else {
            return Err(ProxyError::NoHealthyUpstream {
                service: ctx.service.clone(),
            });
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let now = Instant::now();
            if now >= deadline {
                return Err(ProxyError::UpstreamTimeout {
                    elapsed_ms: policy.timeout.as_millis() as u64,
                });
            }
            let remaining = deadline - now;

            let Some(endpoint) = upstream.select() else {
                return Err(ProxyError::NoHealthyUpstream {
                    service: ctx.service.clone(),
                });
            };

            let permit = match &policy.breaker {
                Some(spec) => {
                    let breaker = self.stores.breakers.checkout(route.id(), &endpoint.addr, spec);
                    match breaker.try_acquire() {
                        Ok(permit) => Some(permit),
                        Err(wait) => {
                            tracing::warn!(
                                request_id = %ctx.id,
                                route = %ctx.route_id,
                                endpoint = %endpoint.addr,
                                "circuit open, short-circuiting"
                            );
                            return Err(ProxyError::CircuitOpen {
                                service: ctx.service.clone(),
                                retry_after: wait,
                            });
                        }
                    }
                }
                None => None,
            };

            let attempt_body = match &mut source {
                BodySource::Buffered(bytes) => AttemptBody::Buffered(bytes.clone()),
                BodySource::Once(slot) => match slot.take() {
                    Some(body) => AttemptBody::Streamed(body),
                    None => {
                        return Err(ProxyError::Internal("request body already consumed".into()));
                    }
                },
            };

            let guard = InFlightGuard::acquire(&endpoint);
            let result = self
                .forwarder
                .send(ctx, &endpoint.addr, attempt_body, remaining)
                .await;

            match result {
                Ok(response) if response.status.is_server_error() => {
                    if let Some(permit) = permit {
                        permit.record_failure();
                    }
                    match next_backoff(retry, attempt, max_attempts, deadline) {
                        Some(delay) => {
                            tracing::debug!(
                                request_id = %ctx.id,
                                endpoint = %endpoint.addr,
                                status = response.status.as_u16(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "retrying after upstream 5xx"
                            );
                            drop(response);
                            drop(guard);
                            tokio::time::sleep(delay).await;
                        }
                        // Out of attempts or budget: the 5xx goes to the
                        // client as-is.
                        None => return Ok(hold_guard(response, guard)),
                    }
                }
                Ok(response) => {
                    if let Some(permit) = permit {
                        permit.record_success();
                    }
                    return Ok(hold_guard(response, guard));
                }
                Err(err) => {
                    drop(guard);
                    match permit {
                        Some(permit) if err.counts_as_breaker_failure() => permit.record_failure(),
                        // Unclassified outcomes release the permit
                        // without counting.
                        _ => {}
                    }
                    if err.is_retryable() {
                        if let Some(delay) = next_backoff(retry, attempt, max_attempts, deadline) {
                            tracing::debug!(
                                request_id = %ctx.id,
                                endpoint = %endpoint.addr,
                                error = %err,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "retrying after upstream failure"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Computes the sleep before the next attempt, or `None` when retrying
/// is not allowed (no attempts left, or the backoff would overrun the
/// deadline).
fn next_backoff(
    retry: Option<&RetrySpec>,
    attempt: u32,
    max_attempts: u32,
    deadline: Instant,
) -> Option<Duration> {
    let retry = retry?;
    if attempt >= max_attempts {
        return None;
    }
    let delay = retry.backoff.delay_for(attempt - 1);
    if Instant::now() + delay >= deadline {
        return None;
    }
    Some(delay)
}

/// Ties the endpoint's in-flight count to the response body: the slot
/// frees when the stream finishes (or the client walks away), not when
/// the headers go out.
fn hold_guard(mut response: ProxyResponse, guard: InFlightGuard) -> ProxyResponse {
    let body = std::mem::replace(&mut response.body, Body::empty());
    response.body = Body::from_stream(GuardedStream {
        inner: body.into_data_stream(),
        _guard: guard,
    });
    response
}

struct GuardedStream<S> {
    inner: S,
    _guard: InFlightGuard,
}

impl<S> Stream for GuardedStream<S>
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Unpin,
{
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ===== Tests =====
