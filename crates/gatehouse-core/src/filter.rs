//! Per-route filter specifications.
//!
//! A route carries an ordered list of [`FilterSpec`] entries. Order in the
//! config document is execution order: request-phase hooks run first-to-last
//! before forwarding, response-phase hooks run last-to-first on the way back
//! out, so the first filter wraps everything after it.
//!
//! Three kinds ([`Retry`](FilterSpec::Retry), [`Timeout`](FilterSpec::Timeout)
//! and [`CircuitBreaker`](FilterSpec::CircuitBreaker)) do not hook the request;
//! they govern the forwarding attempt itself and are applied by the runtime
//! at the call boundary. Each of those may appear at most once per route.
//!
//! ```yaml
//! filters:
//!   - auth_check: { secret: change-me }
//!   - rate_limit: { capacity: 20, refill_per_second: 10 }
//!   - rewrite_path:
//!       template: /orders/{id}
//!   - timeout: { total_ms: 5000 }
//!   - retry: { max_attempts: 3 }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Filter list
// ─────────────────────────────────────────────────────────────────────────────

/// One configured filter on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FilterSpec {
    /// Replace the forwarded path using captured `{param}` values.
    RewritePath(RewritePathSpec),
    /// Add a header to the forwarded request or the returned response.
    AddHeader(AddHeaderSpec),
    /// Token-bucket admission per client key.
    RateLimit(RateLimitSpec),
    /// Per-(route, endpoint) circuit breaking at the call boundary.
    CircuitBreaker(CircuitBreakerSpec),
    /// Re-attempt retryable upstream failures at the call boundary.
    Retry(RetrySpec),
    /// Total deadline for the route, shared across all attempts.
    Timeout(TimeoutSpec),
    /// Bearer-token validation; rejects with 401 before any other work.
    AuthCheck(AuthCheckSpec),
}

impl FilterSpec {
    /// Stable snake_case name, matching the config spelling.
    pub fn kind(&self) -> &'static str {
        match self {
            FilterSpec::RewritePath(_) => "rewrite_path",
            FilterSpec::AddHeader(_) => "add_header",
            FilterSpec::RateLimit(_) => "rate_limit",
            FilterSpec::CircuitBreaker(_) => "circuit_breaker",
            FilterSpec::Retry(_) => "retry",
            FilterSpec::Timeout(_) => "timeout",
            FilterSpec::AuthCheck(_) => "auth_check",
        }
    }

    /// Whether this filter governs the forwarding attempt rather than
    /// hooking the request/response phases.
    pub fn is_call_boundary(&self) -> bool {
        matches!(
            self,
            FilterSpec::Retry(_) | FilterSpec::Timeout(_) | FilterSpec::CircuitBreaker(_)
        )
    }

    /// Parameter sanity checks run during route validation.
    /// Returns a human-readable reason on failure.
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            FilterSpec::RewritePath(s) => {
                if !s.template.starts_with('/') {
                    return Err("rewrite_path template must start with '/'".into());
                }
            }
            FilterSpec::AddHeader(s) => {
                if s.name.trim().is_empty() {
                    return Err("add_header name cannot be empty".into());
                }
                if s.name.contains(|c: char| c.is_whitespace() || c == ':') {
                    return Err(format!("add_header name '{}' is not a valid header name", s.name));
                }
            }
            FilterSpec::RateLimit(s) => {
                if s.capacity == 0 {
                    return Err("rate_limit capacity must be greater than 0".into());
                }
                if !(s.refill_per_second > 0.0) || !s.refill_per_second.is_finite() {
                    return Err("rate_limit refill_per_second must be a positive number".into());
                }
            }
            FilterSpec::CircuitBreaker(s) => {
                if s.failure_threshold == 0 {
                    return Err("circuit_breaker failure_threshold must be greater than 0".into());
                }
                if s.window_ms == 0 || s.cooldown_ms == 0 {
                    return Err("circuit_breaker window_ms and cooldown_ms must be greater than 0".into());
                }
            }
            FilterSpec::Retry(s) => {
                if s.max_attempts == 0 {
                    return Err("retry max_attempts must be at least 1".into());
                }
            }
            FilterSpec::Timeout(s) => {
                if s.total_ms == 0 {
                    return Err("timeout total_ms must be greater than 0".into());
                }
            }
            FilterSpec::AuthCheck(s) => {
                if s.secret.trim().is_empty() {
                    return Err("auth_check secret cannot be empty".into());
                }
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutation filters
// ─────────────────────────────────────────────────────────────────────────────

/// Rewrite the forwarded path.
///
/// The template may reference parameters captured by the route's path
/// predicate: pattern `/api/orders/{id}` with template `/orders/{id}`
/// forwards `/api/orders/42` as `/orders/42`. A placeholder with no
/// captured value is left verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewritePathSpec {
    /// Replacement path template.
    pub template: String,
}

/// Which direction an [`AddHeaderSpec`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderPhase {
    /// Add to the request before forwarding.
    #[default]
    Request,
    /// Add to the response before returning it to the client.
    Response,
}

/// Add a static header on the configured phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddHeaderSpec {
    /// Header name.
    pub name: String,
    /// Header value, taken literally.
    pub value: String,
    /// Request or response side. Defaults to request.
    #[serde(default)]
    pub phase: HeaderPhase,
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission filters
// ─────────────────────────────────────────────────────────────────────────────

/// How the rate limiter derives the client key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    /// Peer IP, honouring `x-forwarded-for` / `x-real-ip` when present.
    #[default]
    ClientIp,
    /// The authenticated principal; falls back to client IP when anonymous.
    Principal,
    /// A named request header; absent header falls back to client IP.
    Header { name: String },
}

/// Token-bucket rate limit per client key.
///
/// Buckets start full and refill continuously at `refill_per_second`,
/// capped at `capacity`. Requests that find no whole token are rejected
/// with 429 and a `retry-after` hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    /// Maximum burst (bucket capacity) in tokens.
    pub capacity: u32,
    /// Sustained refill rate, tokens per second.
    pub refill_per_second: f64,
    /// Client key derivation. Defaults to client IP.
    #[serde(default)]
    pub key: RateLimitKey,
}

/// Bearer-token validation parameters (HMAC-SHA256 signed tokens).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCheckSpec {
    /// Shared HMAC secret used to verify token signatures.
    pub secret: String,
    /// When set, the token `iss` claim must equal this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// When set, the token `aud` claim must contain this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Call-boundary filters
// ─────────────────────────────────────────────────────────────────────────────

/// Circuit-breaker parameters, applied per (route, endpoint) pair.
///
/// The failure window is a fixed window: the count resets when `window_ms`
/// elapses since the first counted failure. Reaching `failure_threshold`
/// within one window opens the circuit for `cooldown_ms`, after which a
/// single trial request is admitted (half-open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSpec {
    /// Failures within one window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Width of the fixed failure-counting window.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// How long the circuit stays open before admitting a trial.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerSpec {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_ms: default_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_window_ms() -> u64 {
    10_000
}
fn default_cooldown_ms() -> u64 {
    30_000
}

/// Total route deadline, shared across every forwarding attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSpec {
    /// Deadline in milliseconds, measured from dispatch start.
    pub total_ms: u64,
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryBackoff {
    /// Same delay every attempt.
    Fixed { delay_ms: u64 },
    /// Delay increases linearly: `base_ms * attempt`.
    Linear { base_ms: u64 },
    /// Exponential backoff capped at `max_ms`, with optional jitter.
    ///
    /// Jitter is a deterministic ±12.5% alternation around the capped
    /// delay, decorrelating retries without consulting a RNG.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

impl RetryBackoff {
    /// Returns the sleep duration before the given retry attempt (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = match self {
            RetryBackoff::Fixed { delay_ms } => *delay_ms,
            RetryBackoff::Linear { base_ms } => base_ms.saturating_mul(u64::from(attempt) + 1),
            RetryBackoff::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                let exp = 1u64
                    .checked_shl(attempt)
                    .and_then(|s| base_ms.checked_mul(s))
                    .unwrap_or(*max_ms);
                let capped = exp.min(*max_ms);
                if *jitter {
                    let eighth = capped / 8;
                    if attempt % 2 == 0 {
                        capped.saturating_add(eighth)
                    } else {
                        capped.saturating_sub(eighth)
                    }
                    .min(*max_ms)
                } else {
                    capped
                }
            }
        };
        Duration::from_millis(ms)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Exponential {
            base_ms: 50,
            max_ms: 1_000,
            jitter: true,
        }
    }
}

/// Retry parameters for retryable upstream failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Total attempts including the first (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay strategy between attempts.
    #[serde(default)]
    pub backoff: RetryBackoff,
    /// Also replay POST/PATCH. Off by default: replaying a non-idempotent
    /// verb can duplicate side effects.
    #[serde(default)]
    pub retry_non_idempotent: bool,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: RetryBackoff::default(),
            retry_non_idempotent: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ── Backoff math ──────────────────────────────────────────────────────────

    #[test]
    fn fixed_backoff_is_constant() {
        let b = RetryBackoff::Fixed { delay_ms: 500 };
        assert_eq!(b.delay_for(0), Duration::from_millis(500));
        assert_eq!(b.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_grows_with_attempt() {
        let b = RetryBackoff::Linear { base_ms: 200 };
        assert_eq!(b.delay_for(0), Duration::from_millis(200));
        assert_eq!(b.delay_for(2), Duration::from_millis(600));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let b = RetryBackoff::Exponential {
            base_ms: 100,
            max_ms: 800,
            jitter: false,
        };
        assert_eq!(b.delay_for(0), Duration::from_millis(100));
        assert_eq!(b.delay_for(1), Duration::from_millis(200));
        assert_eq!(b.delay_for(3), Duration::from_millis(800));
        assert_eq!(b.delay_for(30), Duration::from_millis(800));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let b = RetryBackoff::Exponential {
            base_ms: 500,
            max_ms: 1_000,
            jitter: true,
        };
        for attempt in 0..10 {
            assert!(b.delay_for(attempt).as_millis() <= 1_000);
        }
    }

    // ── Spec plumbing ─────────────────────────────────────────────────────────

    #[test]
    fn kind_names_match_config_spelling() {
        let spec = FilterSpec::Timeout(TimeoutSpec { total_ms: 1 });
        assert_eq!(spec.kind(), "timeout");
        assert!(spec.is_call_boundary());

        let spec = FilterSpec::AddHeader(AddHeaderSpec {
            name: "x-extra".into(),
            value: "1".into(),
            phase: HeaderPhase::default(),
        });
        assert_eq!(spec.kind(), "add_header");
        assert!(!spec.is_call_boundary());
    }

    #[test]
    fn filter_list_deserializes_from_tagged_yaml() {
        let yaml = r#"
- auth_check: { secret: change-me }
- rate_limit: { capacity: 20, refill_per_second: 10 }
- rewrite_path:
    template: /orders/{id}
- add_header: { name: x-gateway, value: gatehouse, phase: response }
- circuit_breaker: { failure_threshold: 3 }
- timeout: { total_ms: 5000 }
- retry: { max_attempts: 2, backoff: { kind: fixed, delay_ms: 10 } }
"#;
        let filters: Vec<FilterSpec> = serde_yaml::from_str(yaml).unwrap();
        let kinds: Vec<&str> = filters.iter().map(FilterSpec::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "auth_check",
                "rate_limit",
                "rewrite_path",
                "add_header",
                "circuit_breaker",
                "timeout",
                "retry"
            ]
        );

        match &filters[4] {
            FilterSpec::CircuitBreaker(cb) => {
                assert_eq!(cb.failure_threshold, 3);
                // unspecified fields take defaults
                assert_eq!(cb.window_ms, default_window_ms());
            }
            other => panic!("expected circuit_breaker, got {}", other.kind()),
        }
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn zero_capacity_rate_limit_is_rejected() {
        let spec = FilterSpec::RateLimit(RateLimitSpec {
            capacity: 0,
            refill_per_second: 1.0,
            key: RateLimitKey::default(),
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn non_positive_refill_is_rejected() {
        for refill in [0.0, -1.0, f64::NAN] {
            let spec = FilterSpec::RateLimit(RateLimitSpec {
                capacity: 1,
                refill_per_second: refill,
                key: RateLimitKey::default(),
            });
            assert!(spec.validate().is_err(), "refill {refill} should fail");
        }
    }

    #[test]
    fn rewrite_template_must_be_absolute() {
        let spec = FilterSpec::RewritePath(RewritePathSpec {
            template: "orders/{id}".into(),
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn header_name_must_be_token() {
        let spec = FilterSpec::AddHeader(AddHeaderSpec {
            name: "x bad".into(),
            value: "v".into(),
            phase: HeaderPhase::Request,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn zero_attempt_retry_is_rejected() {
        let spec = FilterSpec::Retry(RetrySpec {
            max_attempts: 0,
            ..RetrySpec::default()
        });
        assert!(spec.validate().is_err());
    }
}
