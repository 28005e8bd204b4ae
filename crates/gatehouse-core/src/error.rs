//! Error types for `gatehouse-core`.
//!
//! [`ConfigError`] covers every failure mode that can be detected at
//! *definition time* (empty ids, duplicate registrations, unresolvable
//! service references, malformed path templates, invalid filter parameters)
//! before any network I/O occurs. Runtime failures (connection refused,
//! upstream timeout, …) belong in the runtime crate (`gatehouse-proxy`).

use thiserror::Error;

/// Definition-time / configuration error for the gateway contract.
///
/// All variants are `#[non_exhaustive]` at the enum level so future releases
/// can add new failure modes without breaking existing `match` arms.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    // ── Listener ────────────────────────────────────────────────────────────
    /// The `listen` address does not parse as `host:port`.
    #[error("listen address '{0}' is not a valid socket address")]
    InvalidListenAddr(String),

    /// The global `request_timeout_ms` is zero, which would reject every request.
    #[error("request timeout must be greater than 0 ms")]
    InvalidTimeout,

    // ── Routes ──────────────────────────────────────────────────────────────
    /// The configuration contains no routes.
    #[error("gateway config must define at least one route")]
    NoRoutes,

    /// A route `id` field is empty or whitespace-only.
    #[error("route id cannot be empty")]
    EmptyRouteId,

    /// A route with this id has already been registered.
    #[error("route '{0}' is already registered")]
    DuplicateRoute(String),

    /// A route references a service name that is not present in the service list.
    #[error("route '{0}' references unknown service '{1}'")]
    UnknownService(String, String),

    /// A route path template is syntactically invalid.
    #[error("route '{0}' has an invalid path template: {1}")]
    InvalidPathPattern(String, String),

    /// A header or query predicate is malformed (bad regex, conflicting matcher).
    #[error("route '{0}' has an invalid predicate: {1}")]
    InvalidPredicate(String, String),

    /// A filter entry on this route carries invalid parameters.
    #[error("route '{0}' has an invalid filter: {1}")]
    InvalidFilter(String, String),

    // ── Services ────────────────────────────────────────────────────────────
    /// The configuration contains no services.
    #[error("gateway config must define at least one service")]
    NoServices,

    /// A service `name` field is empty or whitespace-only.
    #[error("service name cannot be empty")]
    EmptyServiceName,

    /// A service with this name has already been registered.
    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    /// A service declares no endpoints.
    #[error("service '{0}' must declare at least one endpoint")]
    NoEndpoints(String),

    /// A service endpoint address is syntactically invalid.
    #[error("service '{0}' has an invalid endpoint: {1}")]
    InvalidEndpoint(String, String),

    /// A service lists the same endpoint address twice.
    #[error("service '{0}' lists endpoint '{1}' more than once")]
    DuplicateEndpoint(String, String),

    /// A service health-check block carries invalid parameters.
    #[error("service '{0}' has an invalid health check: {1}")]
    InvalidHealthCheck(String, String),

    // ── Document handling ───────────────────────────────────────────────────
    /// The config file could not be read.
    #[error("failed to read config file '{0}': {1}")]
    Io(String, String),

    /// The config document is not valid YAML for [`GatewayConfig`].
    #[error("failed to parse config: {0}")]
    Parse(String),
}
