//! Definition-time contract for the Gatehouse edge gateway.
//!
//! This crate defines the *configuration types and pure evaluators* for the
//! gateway. No runtime concerns live here; those belong in
//! `gatehouse-proxy` (route table, filter pipeline, balancer, breaker,
//! reverse proxy, HTTP server).
//!
//! # Architecture mapping
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              gatehouse-core  (this crate)                   │
//! │  RequestHead / HttpMethod     PathPattern + captures        │
//! │  Predicate → CompiledPredicate    FilterSpec list           │
//! │  UpstreamSpec / Endpoint      GatewayConfig + validate()    │
//! │  ConfigError                                                │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │  depends on
//! ┌──────────────────────────▼──────────────────────────────────┐
//! │              gatehouse-proxy  (runtime crate)               │
//! │  RouteTable snapshots (arc-swap install / load)             │
//! │  FilterChain hooks + CallPolicy (retry/timeout/breaker)     │
//! │  UpstreamDirectory + balancer + health prober               │
//! │  Forwarder (reqwest, streaming)   GatewayServer (axum)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust
//! use gatehouse_core::{
//!     EndpointAddr, GatewayConfig, Predicate, RouteSpec, UpstreamSpec,
//! };
//!
//! let config = GatewayConfig::new()
//!     .with_service(UpstreamSpec::new(
//!         "orders",
//!         EndpointAddr::new("127.0.0.1", 8081),
//!     ))
//!     .with_route(RouteSpec::new(
//!         "orders-api",
//!         Predicate::path("/api/orders/{id}"),
//!         "orders",
//!     ));
//!
//! config.validate().expect("gateway config is valid");
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod path;
pub mod predicate;
pub mod request;
pub mod route;
pub mod upstream;

// ── Flat re-exports ────────────────────────────────────────────────────────

pub use config::GatewayConfig;
pub use error::ConfigError;
pub use filter::{
    AddHeaderSpec, AuthCheckSpec, CircuitBreakerSpec, FilterSpec, HeaderPhase, RateLimitKey,
    RateLimitSpec, RetryBackoff, RetrySpec, RewritePathSpec, TimeoutSpec,
};
pub use path::{PathParams, PathPattern, PathSegment, PatternError};
pub use predicate::{CompiledPredicate, ParamMatch, Predicate, PredicateError};
pub use request::{HttpMethod, RequestHead, parse_query};
pub use route::RouteSpec;
pub use upstream::{
    AddrError, BalanceStrategy, Endpoint, EndpointAddr, HealthCheckSpec, HealthState,
    UpstreamSpec,
};
