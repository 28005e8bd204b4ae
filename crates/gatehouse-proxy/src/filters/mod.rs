//! Built-in route filters.
//!
//! Each submodule implements one [`RouteFilter`](crate::pipeline::RouteFilter)
//! kind from the config surface. Call-boundary filters (timeout, retry,
//! circuit breaker) have no hook here; they compile into the route's
//! [`CallPolicy`](crate::pipeline::CallPolicy) instead.

pub mod auth;
pub mod headers;
pub mod rate_limit;
pub mod rewrite;
