//! End-to-end gateway tests: real listener, real upstreams, real HTTP.

use std::net::SocketAddr;
use std::time::Duration;

use gatehouse_core::{
    AddHeaderSpec, AuthCheckSpec, BalanceStrategy, CircuitBreakerSpec, EndpointAddr, FilterSpec,
    GatewayConfig, HeaderPhase, HealthCheckSpec, Predicate, RateLimitKey, RateLimitSpec,
    RetryBackoff, RetrySpec, RewritePathSpec, RouteSpec, TimeoutSpec, UpstreamSpec,
};
use gatehouse_testing::{StubUpstream, assert_error_code, spawn_gateway, spawn_gateway_from_file};
use serde_json::Value;

// ── Helpers ─────────────────────────────────────────────────────────────

fn url(gateway: SocketAddr, path: &str) -> String {
    format!("http://{gateway}{path}")
}

fn route(id: &str, path: &str, service: &str) -> RouteSpec {
    RouteSpec::new(id, Predicate::path(path), service)
}

async fn body_json(response: reqwest::Response) -> Value {
    response.json().await.unwrap_or(Value::Null)
}

#[derive(serde::Serialize)]
struct Claims {
    sub: String,
    exp: i64,
}

fn token(secret: &str, sub: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        exp: chrono::Utc::now().timestamp() + 120,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encodes")
}

// ── Routing and filters ─────────────────────────────────────────────────

#[tokio::test]
async fn routes_rewrite_and_forward_to_the_upstream() {
    let upstream = StubUpstream::echo("orders").await;
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(
            route("orders-api", "/api/orders/{id}", "orders")
                .with_filter(FilterSpec::RewritePath(RewritePathSpec {
                    template: "/orders/{id}".into(),
                }))
                .with_filter(FilterSpec::AddHeader(AddHeaderSpec {
                    name: "x-source".into(),
                    value: "gatehouse".into(),
                    phase: HeaderPhase::Request,
                }))
                .with_filter(FilterSpec::AddHeader(AddHeaderSpec {
                    name: "x-served-by".into(),
                    value: "edge".into(),
                    phase: HeaderPhase::Response,
                })),
        );
    let gateway = spawn_gateway(config).await;

    let client = reqwest::Client::new();
    let response = client
        .get(url(gateway, "/api/orders/42?page=2"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["x-gateway-route"], "orders-api");
    assert_eq!(response.headers()["x-served-by"], "edge");
    assert!(response.headers().contains_key("x-request-id"));

    let seen = body_json(response).await;
    assert_eq!(seen["path"], "/orders/42");
    assert_eq!(seen["query"], "page=2");
    assert_eq!(seen["headers"]["x-source"], "gatehouse");
    assert_eq!(seen["headers"]["x-forwarded-for"], "127.0.0.1");
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn unmatched_paths_return_the_error_envelope() {
    let upstream = StubUpstream::echo("orders").await;
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(route("orders-api", "/api/orders/{id}", "orders"));
    let gateway = spawn_gateway(config).await;

    let response = reqwest::get(url(gateway, "/nope")).await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let body = body_json(response).await;
    assert_error_code!(body, "NO_ROUTE_MATCHED");
    assert!(body["error"]["message"].as_str().unwrap().contains("/nope"));
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn more_specific_routes_win_regardless_of_order() {
    let list = StubUpstream::echo("list").await;
    let wild = StubUpstream::echo("wild").await;
    // The catch-all is declared first; specificity must still beat it.
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("list", list.addr()))
        .with_service(UpstreamSpec::new("wild", wild.addr()))
        .with_route(route("catch-all", "/api/{*rest}", "wild"))
        .with_route(route("orders-list", "/api/orders", "list"));
    let gateway = spawn_gateway(config).await;

    let seen = body_json(reqwest::get(url(gateway, "/api/orders")).await.unwrap()).await;
    assert_eq!(seen["name"], "list");

    let seen = body_json(reqwest::get(url(gateway, "/api/anything/else")).await.unwrap()).await;
    assert_eq!(seen["name"], "wild");
}

#[tokio::test]
async fn post_bodies_stream_through() {
    let upstream = StubUpstream::echo("orders").await;
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(route("orders-api", "/api/orders", "orders"));
    let gateway = spawn_gateway(config).await;

    let response = reqwest::Client::new()
        .post(url(gateway, "/api/orders"))
        .body("hello gateway")
        .send()
        .await
        .unwrap();
    let seen = body_json(response).await;
    assert_eq!(seen["method"], "POST");
    assert_eq!(seen["body"], "hello gateway");
}

// ── Admission ───────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limits_reject_bursts_with_a_retry_hint() {
    let upstream = StubUpstream::echo("orders").await;
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(
            route("orders-api", "/api/orders/{id}", "orders").with_filter(FilterSpec::RateLimit(
                RateLimitSpec {
                    capacity: 2,
                    refill_per_second: 0.5,
                    key: RateLimitKey::ClientIp,
                },
            )),
        );
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let ok = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
        assert_eq!(ok.status().as_u16(), 200);
    }
    let limited = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
    assert_eq!(limited.status().as_u16(), 429);
    let wait: u64 = limited.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(wait >= 1, "retry-after should hint a wait, got {wait}");
    let body = body_json(limited).await;
    assert_error_code!(body, "RATE_LIMITED");
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn bearer_tokens_gate_protected_routes() {
    let upstream = StubUpstream::echo("orders").await;
    let secret = "edge-secret";
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(
            route("orders-api", "/api/orders/{id}", "orders").with_filter(FilterSpec::AuthCheck(
                AuthCheckSpec {
                    secret: secret.into(),
                    issuer: None,
                    audience: None,
                },
            )),
        );
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();

    let missing = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 401);
    assert_error_code!(body_json(missing).await, "UNAUTHORIZED");

    let garbage = client
        .get(url(gateway, "/api/orders/1"))
        .header("authorization", "Bearer not-a-token")
        .send()
        .await
        .unwrap();
    assert_eq!(garbage.status().as_u16(), 401);

    let valid = client
        .get(url(gateway, "/api/orders/1"))
        .header("authorization", format!("Bearer {}", token(secret, "alice")))
        .send()
        .await
        .unwrap();
    assert_eq!(valid.status().as_u16(), 200);
    assert_eq!(upstream.hits(), 1);
}

// ── Resilience ──────────────────────────────────────────────────────────

#[tokio::test]
async fn retries_replay_until_the_upstream_recovers() {
    let upstream = StubUpstream::fail_first(1).await;
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(
            route("orders-api", "/api/orders/{id}", "orders").with_filter(FilterSpec::Retry(
                RetrySpec {
                    max_attempts: 3,
                    backoff: RetryBackoff::Fixed { delay_ms: 10 },
                    retry_non_idempotent: false,
                },
            )),
        );
    let gateway = spawn_gateway(config).await;

    let response = reqwest::get(url(gateway, "/api/orders/1")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn open_breakers_short_circuit_then_recover() {
    let upstream = StubUpstream::fail_first(2).await;
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(
            route("orders-api", "/api/orders/{id}", "orders").with_filter(
                FilterSpec::CircuitBreaker(CircuitBreakerSpec {
                    failure_threshold: 2,
                    window_ms: 10_000,
                    cooldown_ms: 300,
                }),
            ),
        );
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let failing = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
        assert_eq!(failing.status().as_u16(), 500);
    }

    // Threshold reached: the next request never touches the upstream.
    let rejected = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
    assert_eq!(rejected.status().as_u16(), 503);
    assert!(rejected.headers().contains_key("retry-after"));
    assert_error_code!(body_json(rejected).await, "CIRCUIT_OPEN");
    assert_eq!(upstream.hits(), 2);

    // After the cooldown one trial is admitted; it succeeds and closes
    // the circuit again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let trial = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
    assert_eq!(trial.status().as_u16(), 200);
    let closed = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
    assert_eq!(closed.status().as_u16(), 200);
    assert_eq!(upstream.hits(), 4);
}

#[tokio::test]
async fn slow_upstreams_map_to_gateway_timeout() {
    let upstream = StubUpstream::delay(Duration::from_millis(500)).await;
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(
            route("orders-api", "/api/orders/{id}", "orders")
                .with_filter(FilterSpec::Timeout(TimeoutSpec { total_ms: 80 })),
        );
    let gateway = spawn_gateway(config).await;

    let response = reqwest::get(url(gateway, "/api/orders/1")).await.unwrap();
    assert_eq!(response.status().as_u16(), 504);
    assert_error_code!(body_json(response).await, "UPSTREAM_TIMEOUT");
}

#[tokio::test]
async fn probed_down_services_reject_without_contacting_upstreams() {
    // Reserve a port, then free it so probes and requests would both be
    // refused. The prober marks the endpoint down; after that the gateway
    // must answer 503 itself rather than attempt a connection (which
    // would surface as 502).
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = EndpointAddr::new("127.0.0.1", listener.local_addr().unwrap().port());
    drop(listener);

    let mut service = UpstreamSpec::new("orders", dead);
    service.health_check = Some(HealthCheckSpec {
        path: "/health".into(),
        interval_ms: 50,
        timeout_ms: 200,
    });
    let config = GatewayConfig::new()
        .with_service(service)
        .with_route(route("orders-api", "/api/orders/{id}", "orders"));
    let gateway = spawn_gateway(config).await;

    // A few probe rounds observe the refused connections.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let response = reqwest::get(url(gateway, "/api/orders/1")).await.unwrap();
    assert_eq!(response.status().as_u16(), 503);
    assert_error_code!(body_json(response).await, "NO_HEALTHY_UPSTREAM");
}

// ── Balancing ───────────────────────────────────────────────────────────

#[tokio::test]
async fn round_robin_spreads_requests_evenly() {
    let a = StubUpstream::echo("a").await;
    let b = StubUpstream::echo("b").await;
    let config = GatewayConfig::new()
        .with_service(
            UpstreamSpec::new("orders", a.addr())
                .with_endpoint(b.addr())
                .with_strategy(BalanceStrategy::RoundRobin),
        )
        .with_route(route("orders-api", "/api/orders/{id}", "orders"));
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();

    for _ in 0..6 {
        let response = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let _ = response.bytes().await;
    }
    assert_eq!(a.hits(), 3);
    assert_eq!(b.hits(), 3);
}

#[tokio::test]
async fn least_connections_prefers_the_idle_endpoint() {
    let slow = StubUpstream::delay(Duration::from_millis(300)).await;
    let quick = StubUpstream::echo("quick").await;
    let config = GatewayConfig::new()
        .with_service(
            UpstreamSpec::new("orders", slow.addr())
                .with_endpoint(quick.addr())
                .with_strategy(BalanceStrategy::LeastConnections),
        )
        .with_route(route("orders-api", "/api/orders/{id}", "orders"));
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();

    // Occupy the first endpoint, then send more while it is busy.
    let held = tokio::spawn({
        let client = client.clone();
        let target = url(gateway, "/api/orders/slow");
        async move { client.get(target).send().await }
    });
    tokio::time::sleep(Duration::from_millis(60)).await;

    for _ in 0..3 {
        let response = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let _ = response.bytes().await;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let held = held.await.unwrap().unwrap();
    assert_eq!(held.status().as_u16(), 200);

    assert_eq!(slow.hits(), 1);
    assert_eq!(quick.hits(), 3);
}

// ── Hot reload ──────────────────────────────────────────────────────────

fn config_doc(addr: &EndpointAddr, with_payments: bool) -> String {
    let mut doc = format!(
        r#"listen: 127.0.0.1:0
services:
  - name: orders
    endpoints: ["{addr}"]
routes:
  - id: orders-api
    predicate:
      path: /api/orders/{{id}}
    service: orders
"#
    );
    if with_payments {
        doc.push_str(
            r#"  - id: payments-api
    predicate:
      path: /api/payments/{id}
    service: orders
"#,
        );
    }
    doc
}

#[tokio::test]
async fn reload_swaps_routes_without_a_restart() {
    let upstream = StubUpstream::echo("orders").await;
    let addr = upstream.addr();

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), config_doc(&addr, false)).unwrap();
    let gateway = spawn_gateway_from_file(file.path()).await;
    let client = reqwest::Client::new();

    let before = client.get(url(gateway, "/api/orders/1")).send().await.unwrap();
    assert_eq!(before.status().as_u16(), 200);
    let missing = client.get(url(gateway, "/api/payments/9")).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    std::fs::write(file.path(), config_doc(&addr, true)).unwrap();
    let reloaded = client
        .post(url(gateway, "/gateway/reload"))
        .send()
        .await
        .unwrap();
    assert_eq!(reloaded.status().as_u16(), 200);
    let body = body_json(reloaded).await;
    assert_eq!(body["table_version"], 2);

    let after = client.get(url(gateway, "/api/payments/9")).send().await.unwrap();
    assert_eq!(after.status().as_u16(), 200);
    assert_eq!(after.headers()["x-gateway-route"], "payments-api");
}

// ── Admin plane ─────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_plane_reports_health_and_readiness() {
    let upstream = StubUpstream::echo("orders").await;
    let config = GatewayConfig::new()
        .with_service(UpstreamSpec::new("orders", upstream.addr()))
        .with_route(route("orders-api", "/api/orders/{id}", "orders"));
    let gateway = spawn_gateway(config).await;

    let health = body_json(reqwest::get(url(gateway, "/health")).await.unwrap()).await;
    assert_eq!(health["status"], "up");

    let ready = body_json(reqwest::get(url(gateway, "/ready")).await.unwrap()).await;
    assert_eq!(ready["table_version"], 1);
    assert_eq!(ready["routes"], 1);
    assert_eq!(ready["services"][0]["name"], "orders");

    let routes = body_json(reqwest::get(url(gateway, "/gateway/routes")).await.unwrap()).await;
    assert_eq!(routes["routes"][0]["id"], "orders-api");
}
