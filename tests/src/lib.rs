//! Test harness for the Gatehouse gateway.
//!
//! Everything here runs real HTTP on loopback ports: scripted upstream
//! servers ([`StubUpstream`]) and a fully started gateway
//! ([`spawn_gateway`]), so integration tests exercise the same code
//! paths production traffic does.

pub mod stub;

pub use stub::{StubBehavior, StubUpstream};

use std::net::SocketAddr;
use std::path::Path;

use gatehouse_core::GatewayConfig;
use gatehouse_proxy::server::GatewayServer;

/// Binds the gateway on an ephemeral loopback port and serves it in the
/// background. The config's `listen` address is overridden.
pub async fn spawn_gateway(config: GatewayConfig) -> SocketAddr {
    let bound = GatewayServer::new(config.with_listen("127.0.0.1:0"))
        .bind()
        .await
        .expect("gateway should bind");
    let addr = bound.addr();
    tokio::spawn(bound.serve());
    addr
}

/// Like [`spawn_gateway`], but starts from a config file so the reload
/// endpoint has something to re-read. File watching stays off; tests
/// trigger reloads explicitly through `POST /gateway/reload`.
pub async fn spawn_gateway_from_file(path: &Path) -> SocketAddr {
    let bound = GatewayServer::from_file(path)
        .expect("config should load")
        .with_watch(false)
        .bind()
        .await
        .expect("gateway should bind");
    let addr = bound.addr();
    tokio::spawn(bound.serve());
    addr
}

/// Asserts that a gateway error body carries the expected `error.code`.
#[macro_export]
macro_rules! assert_error_code {
    ($body:expr, $code:expr) => {{
        let body = &$body;
        assert_eq!(
            body["error"]["code"].as_str().unwrap_or(""),
            $code,
            "unexpected error body: {}",
            body
        );
    }};
}
