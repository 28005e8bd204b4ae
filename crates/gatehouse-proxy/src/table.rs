//! The compiled route table.
//!
//! Route specs compile once, at startup or reload, into a
//! [`RouteTable`]: predicates compiled to their matchable form, filter
//! chains built, and the whole list pre-sorted so request-time
//! resolution is a single pass that stops at the first match.
//!
//! Ordering is most-specific first:
//!
//! 1. higher path specificity (static segments dominate, captures
//!    count, wildcards rank last),
//! 2. higher configured `priority`,
//! 3. configuration-document order.
//!
//! Tables are immutable once built. [`RouteTableHandle`] holds the
//! current table behind an atomic pointer swap: requests in flight keep
//! the snapshot they resolved against, while new requests pick up a
//! freshly installed table without locking. Versions count up from 1 so
//! operators can tell which config generation served a request.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use gatehouse_core::{
    CompiledPredicate, ConfigError, GatewayConfig, PathParams, PredicateError, RequestHead,
    RouteSpec,
};

use crate::pipeline::{FilterChain, SharedStores};

// ── Compiled routes ─────────────────────────────────────────────────────

/// One route, ready to match and to run.
#[derive(Debug)]
pub struct CompiledRoute {
    pub spec: RouteSpec,
    predicate: CompiledPredicate,
    /// Path specificity of the predicate, fixed at compile time.
    pub specificity: u32,
    pub chain: FilterChain,
}

impl CompiledRoute {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Tests the predicate and returns its path captures on a match.
    pub fn matches(&self, head: &RequestHead) -> Option<PathParams> {
        self.predicate.capture(head)
    }
}

// ── Table ───────────────────────────────────────────────────────────────

/// An immutable, pre-sorted snapshot of every route.
#[derive(Debug)]
pub struct RouteTable {
    version: u64,
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    /// Compiles a validated config into a table.
    ///
    /// Validation runs here as well, so every table in existence is
    /// known-good regardless of which path built it.
    pub fn build(
        config: &GatewayConfig,
        version: u64,
        stores: &Arc<SharedStores>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let default_timeout = Duration::from_millis(config.request_timeout_ms);

        let mut routes = Vec::with_capacity(config.routes.len());
        for spec in &config.routes {
            let predicate = CompiledPredicate::compile(&spec.predicate).map_err(|err| match err {
                PredicateError::Pattern(p) => {
                    ConfigError::InvalidPathPattern(spec.id.clone(), p.to_string())
                }
                other => ConfigError::InvalidPredicate(spec.id.clone(), other.to_string()),
            })?;
            let specificity = predicate.specificity();
            let chain = FilterChain::compile(&spec.id, &spec.filters, stores, default_timeout);
            routes.push(Arc::new(CompiledRoute {
                spec: spec.clone(),
                predicate,
                specificity,
                chain,
            }));
        }

        // Stable sort: document order survives as the final tie-break.
        routes.sort_by(|a, b| {
            b.specificity
                .cmp(&a.specificity)
                .then_with(|| b.spec.priority.cmp(&a.spec.priority))
        });

        Ok(Self { version, routes })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Routes in match order.
    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Finds the winning route for a request, with its path captures.
    pub fn resolve(&self, head: &RequestHead) -> Option<(Arc<CompiledRoute>, PathParams)> {
        self.routes
            .iter()
            .find_map(|route| route.matches(head).map(|params| (Arc::clone(route), params)))
    }
}

// ── Handle ──────────────────────────────────────────────────────────────

/// Shared pointer to the current table, swappable without locking.
#[derive(Debug)]
pub struct RouteTableHandle {
    inner: ArcSwap<RouteTable>,
}

impl RouteTableHandle {
    pub fn new(initial: RouteTable) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    /// The table to resolve this request against. Callers hold the
    /// returned snapshot for the whole request lifetime.
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.inner.load_full()
    }

    /// Atomically replaces the current table.
    pub fn install(&self, table: RouteTable) {
        self.inner.store(Arc::new(table));
    }

    pub fn version(&self) -> u64 {
        self.inner.load().version()
    }
}

// ===== Tests =====
