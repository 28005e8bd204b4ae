//! Gateway configuration container and definition-time validation.
//!
//! [`GatewayConfig`] aggregates the three configuration dimensions
//! (listener, services, routes) and exposes a single [`validate()`] method
//! that checks all structural invariants *before* any runtime resources are
//! allocated. The runtime crate builds its route table and upstream
//! directory only from configs that passed validation.
//!
//! [`validate()`]: GatewayConfig::validate

use crate::error::ConfigError;
use crate::route::RouteSpec;
use crate::upstream::UpstreamSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level gateway configuration.
///
/// ```yaml
/// listen: 0.0.0.0:8000
/// request_timeout_ms: 30000
///
/// services:
///   - name: orders
///     endpoints: ["127.0.0.1:8081", "127.0.0.1:8082"]
///
/// routes:
///   - id: orders-api
///     predicate:
///       path: /api/orders/{id}
///     service: orders
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener address, `host:port`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Default total deadline per request in milliseconds, used by routes
    /// that carry no `timeout` filter. Must be > 0.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// All upstream service pools.
    #[serde(default)]
    pub services: Vec<UpstreamSpec>,
    /// All route definitions.
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_ms: default_request_timeout_ms(),
            services: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Construct an empty config with default listener and timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the listener address.
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    /// Builder: set the default request timeout.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Builder: add a service pool.
    pub fn with_service(mut self, service: UpstreamSpec) -> Self {
        self.services.push(service);
        self
    }

    /// Builder: add a route.
    pub fn with_route(mut self, route: RouteSpec) -> Self {
        self.routes.push(route);
        self
    }

    /// Parse a YAML document into a config. Structural validation is a
    /// separate step: call [`validate()`](Self::validate) on the result.
    pub fn from_yaml(doc: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(doc).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        Self::from_yaml(&doc)
    }

    /// Validate all structural invariants of this configuration.
    ///
    /// Returns `Ok(())` if the configuration is structurally sound and can
    /// be used to initialise the gateway runtime. Returns the *first*
    /// detected [`ConfigError`] otherwise.
    ///
    /// Checks performed (in order):
    /// 1. `listen` parses as a socket address.
    /// 2. `request_timeout_ms` is non-zero.
    /// 3. At least one route is defined.
    /// 4. At least one service is defined.
    /// 5. Each service passes its own checks (name, endpoints, health check).
    /// 6. No two services share a name.
    /// 7. Each route passes its own checks (id, predicate, filters).
    /// 8. No two routes share an id.
    /// 9. Every route's `service` refers to a declared service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // ── 1. Listener parses ───────────────────────────────────────────────
        if self.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.listen.clone()));
        }

        // ── 2. Default timeout is non-zero ───────────────────────────────────
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }

        // ── 3. At least one route ────────────────────────────────────────────
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        // ── 4. At least one service ──────────────────────────────────────────
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        // ── 5 + 6. Validate each service, check for duplicates ───────────────
        let mut service_names: HashSet<&str> = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !service_names.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
        }

        // ── 7 + 8 + 9. Validate each route ───────────────────────────────────
        let mut route_ids: HashSet<&str> = HashSet::new();
        for route in &self.routes {
            route.validate()?;
            if !route_ids.insert(route.id.as_str()) {
                return Err(ConfigError::DuplicateRoute(route.id.clone()));
            }
            if !service_names.contains(route.service.as_str()) {
                return Err(ConfigError::UnknownService(
                    route.id.clone(),
                    route.service.clone(),
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
