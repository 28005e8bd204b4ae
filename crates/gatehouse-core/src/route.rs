//! Route definitions: predicate + target service + filter list.

use crate::error::ConfigError;
use crate::filter::FilterSpec;
use crate::predicate::{CompiledPredicate, Predicate, PredicateError};
use serde::{Deserialize, Serialize};

/// A single routing rule.
///
/// Overlap resolution when several routes match the same request: the most
/// path-specific route wins (see
/// [`PathPattern::specificity`](crate::path::PathPattern::specificity)),
/// then higher `priority`, then config-document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Unique stable identifier for this route.
    pub id: String,
    /// Tie-break priority: higher values win among equally specific routes.
    #[serde(default)]
    pub priority: i32,
    /// When this route applies.
    pub predicate: Predicate,
    /// Name of the upstream service this route forwards to.
    pub service: String,
    /// Ordered filter list. Empty means plain pass-through forwarding.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterSpec>,
}

impl RouteSpec {
    /// Create a minimal route with just id, predicate, and target service.
    pub fn new(
        id: impl Into<String>,
        predicate: Predicate,
        service: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            predicate,
            service: service.into(),
            filters: Vec::new(),
        }
    }

    /// Builder: set routing priority (higher = wins ties).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: append a filter.
    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filters.push(filter);
        self
    }

    /// Builder: replace the whole filter list.
    pub fn with_filters(mut self, filters: Vec<FilterSpec>) -> Self {
        self.filters = filters;
        self
    }

    /// Basic sanity checks run during [`GatewayConfig::validate()`].
    ///
    /// [`GatewayConfig::validate()`]: crate::config::GatewayConfig::validate
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::EmptyRouteId);
        }

        // The predicate must compile: path templates parse, regexes build.
        if let Err(e) = CompiledPredicate::compile(&self.predicate) {
            return Err(match e {
                PredicateError::Pattern(p) => {
                    ConfigError::InvalidPathPattern(self.id.clone(), p.to_string())
                }
                other => ConfigError::InvalidPredicate(self.id.clone(), other.to_string()),
            });
        }

        for filter in &self.filters {
            filter
                .validate()
                .map_err(|reason| ConfigError::InvalidFilter(self.id.clone(), reason))?;
        }

        // Call-boundary filters are singletons per route: a second retry or
        // timeout block has no well-defined composition order.
        for kind in ["retry", "timeout", "circuit_breaker"] {
            let n = self.filters.iter().filter(|f| f.kind() == kind).count();
            if n > 1 {
                return Err(ConfigError::InvalidFilter(
                    self.id.clone(),
                    format!("filter '{kind}' may appear at most once"),
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
