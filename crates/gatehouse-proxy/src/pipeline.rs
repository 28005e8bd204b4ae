//! Per-route filter chains.
//!
//! A route's configured filters compile into two things:
//!
//! - a list of **hooks** ([`RouteFilter`] implementations) that run in
//!   configuration order on the request phase and in reverse over the
//!   completed prefix on the response phase, and
//! - a [`CallPolicy`] for the filters that govern the forwarding
//!   attempt itself (timeout, retry, circuit breaker). Those never see
//!   individual requests as hooks; the dispatcher reads the policy at
//!   the call boundary.
//!
//! ```text
//!   request ──> hook 0 ──> hook 1 ──> hook 2 ──> [ call boundary ]
//!                                                       │
//!   client  <── hook 0 <── hook 1 <── hook 2 <── response
//! ```
//!
//! A hook that rejects short-circuits the request phase; the response
//! phase then unwinds only over the hooks that had already completed,
//! so a filter never sees a response for a request it never saw.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatehouse_core::{CircuitBreakerSpec, FilterSpec, RetrySpec};

use crate::breaker::BreakerRegistry;
use crate::context::{ProxyResponse, RequestContext};
use crate::error::ProxyError;
use crate::filters::auth::BearerAuthFilter;
use crate::filters::headers::AddHeaderFilter;
use crate::filters::rate_limit::{RateLimitFilter, RateLimiterStore};
use crate::filters::rewrite::RewritePathFilter;

// ── Shared stores ───────────────────────────────────────────────────────

/// Mutable stores shared by every route and kept across route-table
/// swaps, so a config reload does not reset rate-limit buckets or
/// breaker state.
#[derive(Debug, Default)]
pub struct SharedStores {
    pub breakers: BreakerRegistry,
    pub limiters: RateLimiterStore,
}

impl SharedStores {
    pub fn new() -> Self {
        Self::default()
    }
}

// ── Filter trait ────────────────────────────────────────────────────────

/// What a request-phase hook decided.
#[derive(Debug)]
#[non_exhaustive]
pub enum FilterAction {
    /// Keep going to the next hook (and eventually the upstream).
    Continue,
    /// Stop here and answer the client with this outcome.
    Reject(ProxyError),
}

/// A request/response hook attached to a route.
///
/// `on_request` runs before forwarding and may mutate the context;
/// `on_response` runs after a response exists (upstream or error) and
/// may annotate it. Hooks must tolerate running without a matching
/// response phase: the dispatcher skips `on_response` for hooks that
/// never saw the request.
#[async_trait]
pub trait RouteFilter: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<FilterAction, ProxyError>;

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut ProxyResponse,
    ) -> Result<(), ProxyError>;
}

// ── Call policy ─────────────────────────────────────────────────────────

/// The call-boundary settings for one route.
///
/// Exactly one of each may be configured per route; the timeout always
/// resolves to a concrete value (the gateway default when the route
/// does not set one).
#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// Total deadline for the request, shared across all attempts.
    pub timeout: Duration,
    pub retry: Option<RetrySpec>,
    pub breaker: Option<CircuitBreakerSpec>,
}

// ── Chain ───────────────────────────────────────────────────────────────

/// Outcome of running the request phase.
#[derive(Debug)]
pub struct RunOutcome {
    /// Hooks that completed successfully; the response phase unwinds
    /// over exactly this prefix.
    pub completed: usize,
    /// Set when a hook rejected or failed.
    pub rejection: Option<ProxyError>,
}

/// A route's compiled hooks plus its call policy.
pub struct FilterChain {
    hooks: Vec<Arc<dyn RouteFilter>>,
    policy: CallPolicy,
}

impl FilterChain {
    /// Builds the chain for one route from its validated filter specs.
    ///
    /// Hook order is configuration order. Call-boundary specs are
    /// folded into the [`CallPolicy`] instead of becoming hooks.
    pub fn compile(
        route_id: &str,
        filters: &[FilterSpec],
        stores: &Arc<SharedStores>,
        default_timeout: Duration,
    ) -> Self {
        let mut hooks: Vec<Arc<dyn RouteFilter>> = Vec::new();
        let mut policy = CallPolicy {
            timeout: default_timeout,
            retry: None,
            breaker: None,
        };
        for spec in filters {
            match spec {
                FilterSpec::RewritePath(s) => {
                    hooks.push(Arc::new(RewritePathFilter::new(&s.template)));
                }
                FilterSpec::AddHeader(s) => {
                    hooks.push(Arc::new(AddHeaderFilter::new(s.clone())));
                }
                FilterSpec::RateLimit(s) => {
                    hooks.push(Arc::new(RateLimitFilter::new(
                        route_id,
                        s.clone(),
                        Arc::clone(stores),
                    )));
                }
                FilterSpec::AuthCheck(s) => {
                    hooks.push(Arc::new(BearerAuthFilter::new(s)));
                }
                FilterSpec::Timeout(s) => {
                    policy.timeout = Duration::from_millis(s.total_ms);
                }
                FilterSpec::Retry(s) => {
                    policy.retry = Some(s.clone());
                }
                FilterSpec::CircuitBreaker(s) => {
                    policy.breaker = Some(s.clone());
                }
                _ => {
                    tracing::warn!(route = route_id, kind = spec.kind(), "unhandled filter kind");
                }
            }
        }
        Self { hooks, policy }
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    /// Runs the request phase in order, stopping at the first rejection.
    pub async fn run_request(&self, ctx: &mut RequestContext) -> RunOutcome {
        for (idx, hook) in self.hooks.iter().enumerate() {
            match hook.on_request(ctx).await {
                Ok(FilterAction::Continue) => {}
                Ok(FilterAction::Reject(err)) => {
                    tracing::debug!(
                        request_id = %ctx.id,
                        route = %ctx.route_id,
                        filter = hook.name(),
                        "request rejected by filter"
                    );
                    return RunOutcome {
                        completed: idx,
                        rejection: Some(err),
                    };
                }
                Err(err) => {
                    return RunOutcome {
                        completed: idx,
                        rejection: Some(err),
                    };
                }
            }
        }
        RunOutcome {
            completed: self.hooks.len(),
            rejection: None,
        }
    }

    /// Runs the response phase in reverse over the completed prefix.
    ///
    /// A response hook that fails is logged and skipped; the response
    /// still goes out.
    pub async fn run_response(
        &self,
        ctx: &RequestContext,
        response: &mut ProxyResponse,
        completed: usize,
    ) {
        let upto = completed.min(self.hooks.len());
        for hook in self.hooks[..upto].iter().rev() {
            if let Err(err) = hook.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.id,
                    filter = hook.name(),
                    error = %err,
                    "response filter failed, continuing"
                );
            }
        }
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("hooks", &self.hook_names())
            .field("policy", &self.policy)
            .finish()
    }
}

// ===== Tests =====
