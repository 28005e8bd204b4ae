//! Upstream service pools: addresses, health, and balancing policy.
//!
//! An [`UpstreamSpec`] declares a named pool of endpoint addresses plus the
//! strategy used to pick one per request. Health is *observed* state, not
//! configuration: the runtime attaches it from the prober or an external
//! discovery feed, which is why [`Endpoint`] (address + health snapshot) is
//! a separate type from the bare [`EndpointAddr`] carried in config.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Balancing strategy
// ─────────────────────────────────────────────────────────────────────────────

/// How the balancer picks among healthy endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum BalanceStrategy {
    /// Rotate through healthy endpoints with a shared cursor.
    #[default]
    RoundRobin,
    /// Pick the endpoint with the fewest in-flight requests.
    LeastConnections,
    /// Pick a healthy endpoint uniformly at random.
    Random,
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

/// Last-known health of an endpoint, updated by probing or a discovery feed.
///
/// Only `Healthy` endpoints are eligible for selection. Statically
/// configured endpoints start `Healthy`; `Unknown` appears when a feed
/// delivers an endpoint it has not yet checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum HealthState {
    /// Endpoint is responding normally.
    Healthy,
    /// Endpoint is not responding or failing its health check.
    Unhealthy,
    /// Health has not been determined yet.
    #[default]
    Unknown,
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint address
// ─────────────────────────────────────────────────────────────────────────────

/// Reasons an endpoint address fails to parse.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddrError {
    /// Not of the form `host:port`.
    #[error("endpoint '{0}' must look like host:port")]
    Malformed(String),

    /// The port is not a number in 1-65535.
    #[error("endpoint '{0}' has an invalid port")]
    BadPort(String),

    /// A scheme other than `http` / `https` was given.
    #[error("endpoint '{0}' has an unsupported scheme")]
    BadScheme(String),
}

/// A forwardable endpoint address.
///
/// Parses from `host:port`, `http://host:port`, or `https://host:port`;
/// the bare form is plain HTTP. Serializes back to the same string form,
/// so config endpoint lists stay flat:
///
/// ```yaml
/// endpoints: ["127.0.0.1:8081", "https://orders.internal:8443"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddr {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Forward over TLS.
    pub secure: bool,
}

impl EndpointAddr {
    /// Construct a plain-HTTP address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }

    /// Base URL for forwarding, e.g. `http://127.0.0.1:8081`.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl FromStr for EndpointAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secure, rest) = if let Some(rest) = s.strip_prefix("http://") {
            (false, rest)
        } else if let Some(rest) = s.strip_prefix("https://") {
            (true, rest)
        } else if s.contains("://") {
            return Err(AddrError::BadScheme(s.to_string()));
        } else {
            (false, s)
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddrError::Malformed(s.to_string()))?;
        if host.is_empty() {
            return Err(AddrError::Malformed(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| AddrError::BadPort(s.to_string()))?;
        if port == 0 {
            return Err(AddrError::BadPort(s.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            secure,
        })
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secure {
            write!(f, "https://{}:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Serialize for EndpointAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EndpointAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// An endpoint together with its observed health.
///
/// This is the unit an external discovery feed delivers and the unit the
/// runtime's balancer consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Where to forward.
    pub addr: EndpointAddr,
    /// Last-known health.
    #[serde(default)]
    pub health: HealthState,
    /// When the health was last determined, if ever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Endpoint {
    /// An endpoint with default (`Unknown`) health and no check timestamp.
    pub fn new(addr: EndpointAddr) -> Self {
        Self {
            addr,
            health: HealthState::default(),
            last_checked_at: None,
        }
    }

    /// Builder helper: set the health state.
    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = health;
        self
    }

    /// Builder helper: set the last-checked timestamp.
    pub fn with_checked_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_checked_at = Some(at);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service spec
// ─────────────────────────────────────────────────────────────────────────────

/// Active health-check parameters for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Path probed with GET on every endpoint, e.g. `/health`.
    pub path: String,
    /// Probe cadence in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_probe_interval_ms() -> u64 {
    10_000
}
fn default_probe_timeout_ms() -> u64 {
    2_000
}

/// A named upstream service pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSpec {
    /// Unique name, referenced by routes via `service`.
    pub name: String,
    /// Balancing strategy. Defaults to round robin.
    #[serde(default)]
    pub strategy: BalanceStrategy,
    /// Endpoint addresses in the pool.
    pub endpoints: Vec<EndpointAddr>,
    /// Optional active health checking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

impl UpstreamSpec {
    /// Construct a pool with one endpoint and default strategy.
    pub fn new(name: impl Into<String>, endpoint: EndpointAddr) -> Self {
        Self {
            name: name.into(),
            strategy: BalanceStrategy::default(),
            endpoints: vec![endpoint],
            health_check: None,
        }
    }

    /// Builder: set the balancing strategy.
    pub fn with_strategy(mut self, strategy: BalanceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Builder: add another endpoint.
    pub fn with_endpoint(mut self, addr: EndpointAddr) -> Self {
        self.endpoints.push(addr);
        self
    }

    /// Builder: enable active health checking on the given path.
    pub fn with_health_check(mut self, path: impl Into<String>) -> Self {
        self.health_check = Some(HealthCheckSpec {
            path: path.into(),
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
        });
        self
    }

    /// Basic sanity checks run during [`GatewayConfig::validate()`].
    ///
    /// [`GatewayConfig::validate()`]: crate::config::GatewayConfig::validate
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints(self.name.clone()));
        }
        let mut seen: HashSet<&EndpointAddr> = HashSet::new();
        for addr in &self.endpoints {
            if !seen.insert(addr) {
                return Err(ConfigError::DuplicateEndpoint(
                    self.name.clone(),
                    addr.to_string(),
                ));
            }
        }
        if let Some(hc) = &self.health_check {
            if !hc.path.starts_with('/') {
                return Err(ConfigError::InvalidHealthCheck(
                    self.name.clone(),
                    "path must start with '/'".to_string(),
                ));
            }
            if hc.interval_ms == 0 {
                return Err(ConfigError::InvalidHealthCheck(
                    self.name.clone(),
                    "interval_ms must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
