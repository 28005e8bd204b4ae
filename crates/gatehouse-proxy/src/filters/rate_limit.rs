//! Token-bucket rate limiting.
//!
//! Buckets live in a [`RateLimiterStore`] keyed by `route:client`, so
//! the same client gets an independent budget on every rate-limited
//! route. Buckets start full and refill lazily: each admission check
//! adds `elapsed * refill_per_second` tokens (capped at capacity)
//! before trying to take one. A request that finds less than one whole
//! token is rejected with a retry-after hint sized to the deficit.
//!
//! The store survives route-table swaps; a reload that changes a
//! route's limit parameters re-seeds its buckets on next use.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use gatehouse_core::{RateLimitKey, RateLimitSpec};

use crate::context::{ProxyResponse, RequestContext};
use crate::error::ProxyError;
use crate::pipeline::{FilterAction, RouteFilter, SharedStores};

// ── Buckets ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_per_second,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_second))
        }
    }
}

/// All rate-limit buckets, shared across routes and reloads.
#[derive(Debug, Default)]
pub struct RateLimiterStore {
    buckets: DashMap<String, Bucket>,
}

impl RateLimiterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one token from the bucket for `key`, creating a full
    /// bucket on first sight. Returns the suggested wait on rejection.
    pub fn try_consume(&self, key: &str, spec: &RateLimitSpec) -> Result<(), Duration> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(spec.capacity, spec.refill_per_second));
        // Parameters changed on reload: start over with the new shape.
        if bucket.capacity != f64::from(spec.capacity)
            || bucket.refill_per_second != spec.refill_per_second
        {
            *bucket = Bucket::new(spec.capacity, spec.refill_per_second);
        }
        bucket.try_consume()
    }

    /// Drops buckets that have not been touched for `idle`. Run
    /// periodically so one-off clients do not accumulate forever.
    pub fn purge_idle(&self, idle: Duration) {
        self.buckets
            .retain(|_, bucket| bucket.last_refill.elapsed() < idle);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// ── Filter ──────────────────────────────────────────────────────────────

/// Admission filter enforcing one route's [`RateLimitSpec`].
pub struct RateLimitFilter {
    route_id: String,
    spec: RateLimitSpec,
    stores: Arc<SharedStores>,
}

impl RateLimitFilter {
    pub fn new(route_id: &str, spec: RateLimitSpec, stores: Arc<SharedStores>) -> Self {
        Self {
            route_id: route_id.to_string(),
            spec,
            stores,
        }
    }

    /// Derives the bucket key for this request.
    ///
    /// Every variant falls back to the client IP chain when its primary
    /// source is absent, so anonymous traffic still lands in a bucket.
    fn bucket_key(&self, ctx: &RequestContext) -> String {
        let client = match &self.spec.key {
            RateLimitKey::ClientIp => ctx.client_key(),
            RateLimitKey::Principal => ctx
                .principal
                .clone()
                .unwrap_or_else(|| ctx.client_key()),
            RateLimitKey::Header { name } => ctx
                .head
                .header(&name.to_lowercase())
                .map(str::to_string)
                .unwrap_or_else(|| ctx.client_key()),
        };
        format!("{}:{}", self.route_id, client)
    }
}

#[async_trait]
impl RouteFilter for RateLimitFilter {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<FilterAction, ProxyError> {
        let key = self.bucket_key(ctx);
        match self.stores.limiters.try_consume(&key, &self.spec) {
            Ok(()) => Ok(FilterAction::Continue),
            Err(retry_after) => {
                tracing::warn!(
                    request_id = %ctx.id,
                    route = %self.route_id,
                    key = %key,
                    "rate limit exceeded"
                );
                Ok(FilterAction::Reject(ProxyError::RateLimited {
                    key,
                    retry_after,
                }))
            }
        }
    }

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        response: &mut ProxyResponse,
    ) -> Result<(), ProxyError> {
        response.set_header("x-ratelimit-limit", &self.spec.capacity.to_string());
        Ok(())
    }
}

// ===== Tests =====
