//! Runtime half of the Gatehouse edge gateway.
//!
//! `gatehouse-core` defines the configuration contract; this crate makes
//! it serve traffic. A request walks the modules left to right:
//!
//! ```text
//!        ┌────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!  ──────▶ server │──▶│ dispatch │──▶│ pipeline │──▶│ forward  │──▶ upstream
//!        └────────┘   └────┬─────┘   └────┬─────┘   └──────────┘
//!         axum routing     │              │ hooks: rewrite, headers,
//!         admin plane      │              │        rate limit, auth
//!                     ┌────▼─────┐   ┌────▼─────┐
//!                     │  table   │   │ balancer │──┐
//!                     └──────────┘   └──────────┘  │
//!                      versioned      endpoint     │
//!                      snapshots      selection    │
//!                                    ┌──────────┐  │
//!                                    │ breaker  │◀─┘ per (route, endpoint)
//!                                    └──────────┘
//! ```
//!
//! | Concern                                   | Module        |
//! |-------------------------------------------|---------------|
//! | Listener, admin endpoints, hot reload     | [`server`]    |
//! | Request lifecycle, retries, deadlines     | [`dispatch`]  |
//! | Compiled routes, lock-free table swaps    | [`table`]     |
//! | Filter hooks and the call-boundary policy | [`pipeline`]  |
//! | Built-in filters                          | [`filters`]   |
//! | Endpoint pools and balancing strategies   | [`balancer`]  |
//! | Service directory and health probing      | [`discovery`] |
//! | Circuit breaking                          | [`breaker`]   |
//! | The reverse-proxy HTTP client             | [`forward`]   |
//! | Error taxonomy and wire mapping           | [`error`]     |
//! | Per-request state                         | [`context`]   |
//!
//! # Quick start
//!
//! ```no_run
//! use gatehouse_proxy::server::GatewayServer;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! GatewayServer::from_file("gateway.yaml")?.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod breaker;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod filters;
pub mod forward;
pub mod pipeline;
pub mod server;
pub mod table;

// ── Flat re-exports ────────────────────────────────────────────────────────

pub use context::{ProxyResponse, RequestContext};
pub use dispatch::Dispatcher;
pub use error::{ProxyError, ProxyResult};
pub use pipeline::{CallPolicy, FilterAction, FilterChain, RouteFilter, SharedStores};
pub use server::{BoundGateway, GatewayServer, StartError};
pub use table::{CompiledRoute, RouteTable, RouteTableHandle};
