//! HTTP front door: listener, admin plane, hot reload.
//!
//! One axum router serves two planes on the same listener:
//!
//! | Path                   | Plane | Purpose                                |
//! |------------------------|-------|----------------------------------------|
//! | `GET /health`          | admin | liveness, always `200` once serving    |
//! | `GET /ready`           | admin | table version + per-service health     |
//! | `GET /gateway/routes`  | admin | the installed route table, serialized  |
//! | `POST /gateway/reload` | admin | re-read the config file, swap the table|
//! | everything else        | proxy | dispatched against the route table     |
//!
//! Admin paths are fixed and take precedence over configured routes.
//!
//! Reload is all-or-nothing: the new file is parsed, validated, and
//! compiled into a complete [`RouteTable`] before anything is swapped.
//! A bad file leaves the serving table untouched and answers `400`.
//! When the gateway was started from a file, a watcher task debounces
//! filesystem events on it and triggers the same reload path.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use gatehouse_core::{ConfigError, GatewayConfig, HttpMethod, RequestHead, RouteSpec, parse_query};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;

use crate::discovery::{HealthProber, ProberSet, UpstreamDirectory};
use crate::dispatch::Dispatcher;
use crate::pipeline::SharedStores;
use crate::table::{RouteTable, RouteTableHandle};

/// How often idle rate-limit buckets are swept.
const LIMITER_GC_INTERVAL: Duration = Duration::from_secs(60);
/// Buckets untouched for this long are dropped by the sweep.
const LIMITER_IDLE_AFTER: Duration = Duration::from_secs(600);
/// Settle time after a config file event before re-reading it.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

// ── Startup errors ──────────────────────────────────────────────────────

/// Reasons the gateway fails to come up.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Shared state ────────────────────────────────────────────────────────

/// Everything the handlers need, cloneable per request.
#[derive(Debug, Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    prober: HealthProber,
    probers: Arc<ProberSet>,
    config_path: Option<PathBuf>,
}

/// Wires stores, table, and directory together from a validated config.
fn build_state(config: &GatewayConfig, config_path: Option<PathBuf>) -> Result<AppState, ConfigError> {
    let stores = Arc::new(SharedStores::new());
    let table = RouteTable::build(config, 1, &stores)?;
    let dispatcher = Dispatcher::new(
        Arc::new(RouteTableHandle::new(table)),
        Arc::new(UpstreamDirectory::from_config(config)),
        stores,
    );
    Ok(AppState {
        dispatcher: Arc::new(dispatcher),
        prober: HealthProber::new(),
        probers: Arc::new(ProberSet::new()),
        config_path,
    })
}

// ── Server ──────────────────────────────────────────────────────────────

/// Builder for the gateway process.
pub struct GatewayServer {
    config: GatewayConfig,
    config_path: Option<PathBuf>,
    watch: bool,
}

impl GatewayServer {
    /// Serve an in-memory configuration. Reload endpoints answer `409`
    /// because there is no file to re-read.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            config_path: None,
            watch: false,
        }
    }

    /// Load the configuration from a YAML file and remember the path
    /// for reloads. File watching is on by default.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StartError> {
        let path = path.as_ref();
        let config = GatewayConfig::load(path)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
            watch: true,
        })
    }

    /// Enable or disable the config file watcher.
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Override the listen address from the config document. The
    /// listener is bound once at startup; reloads do not re-bind.
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.config.listen = listen.into();
        self
    }

    /// Validates the config, binds the listener, and starts background
    /// tasks, without serving yet. Lets callers learn the bound address
    /// when the config asked for port `0`.
    pub async fn bind(self) -> Result<BoundGateway, StartError> {
        let state = build_state(&self.config, self.config_path.clone())?;
        state
            .probers
            .restart(&state.prober, state.dispatcher.directory(), &self.config);
        spawn_limiter_gc(Arc::clone(state.dispatcher.stores()));
        if self.watch {
            if let Some(path) = state.config_path.clone() {
                spawn_config_watcher(state.clone(), path);
            }
        }

        let table = state.dispatcher.table().snapshot();
        let app = router(state);
        let listener = TcpListener::bind(self.config.listen.as_str()).await?;
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            table_version = table.version(),
            routes = table.len(),
            "gateway listening"
        );
        Ok(BoundGateway { addr, listener, app })
    }

    /// Bind and serve until shutdown.
    pub async fn run(self) -> Result<(), StartError> {
        self.bind().await?.serve().await
    }
}

/// A gateway with its listener bound but not yet serving.
pub struct BoundGateway {
    addr: SocketAddr,
    listener: TcpListener,
    app: Router,
}

impl BoundGateway {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until ctrl-c.
    pub async fn serve(self) -> Result<(), StartError> {
        axum::serve(
            self.listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "shutdown signal unavailable");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

// ── Router and handlers ─────────────────────────────────────────────────

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/gateway/routes", get(list_routes))
        .route("/gateway/reload", post(reload))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "up" }))
}

async fn ready(State(state): State<AppState>) -> Json<serde_json::Value> {
    let table = state.dispatcher.table().snapshot();
    let services: Vec<serde_json::Value> = state
        .dispatcher
        .directory()
        .health_summary()
        .into_iter()
        .map(|(name, healthy, total)| {
            json!({ "name": name, "healthy": healthy, "endpoints": total })
        })
        .collect();
    Json(json!({
        "status": "up",
        "table_version": table.version(),
        "routes": table.len(),
        "services": services,
    }))
}

async fn list_routes(State(state): State<AppState>) -> Json<serde_json::Value> {
    let table = state.dispatcher.table().snapshot();
    let routes: Vec<RouteSpec> = table.routes().iter().map(|r| r.spec.clone()).collect();
    Json(json!({ "version": table.version(), "routes": routes }))
}

async fn reload(State(state): State<AppState>) -> Response {
    let Some(path) = state.config_path.clone() else {
        let body = json!({
            "error": {
                "code": "NO_CONFIG_FILE",
                "message": "gateway was started without a config file",
            }
        });
        return (StatusCode::CONFLICT, Json(body)).into_response();
    };
    match reload_from_file(&state, &path) {
        Ok(version) => {
            let body = json!({ "status": "reloaded", "table_version": version });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            let body = json!({
                "error": { "code": "INVALID_CONFIG", "message": err.to_string() }
            });
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
    }
}

/// Everything that is not an admin path goes through the dispatcher.
async fn proxy(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let Some(method) = HttpMethod::from_str_ci(parts.method.as_str()) else {
        let body = json!({
            "error": {
                "code": "METHOD_NOT_ALLOWED",
                "message": format!("unsupported method {}", parts.method),
            }
        });
        return (StatusCode::METHOD_NOT_ALLOWED, Json(body)).into_response();
    };

    let raw_query = parts.uri.query().map(str::to_string);
    let mut head = RequestHead::new(method, parts.uri.path());
    if let Some(query) = &raw_query {
        head.query = parse_query(query);
    }
    for (name, value) in &parts.headers {
        head.headers.insert(
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }

    state
        .dispatcher
        .dispatch(head, raw_query, Some(peer.ip().to_string()), body)
        .await
}

// ── Reload ──────────────────────────────────────────────────────────────

/// Re-reads the config file and, if it validates, swaps in a new route
/// table and reconciles upstream state. Breakers and limiter buckets
/// live in [`SharedStores`] and survive the swap.
fn reload_from_file(state: &AppState, path: &Path) -> Result<u64, ConfigError> {
    let config = GatewayConfig::load(path)?;
    let version = state.dispatcher.table().version() + 1;
    let table = RouteTable::build(&config, version, state.dispatcher.stores())?;
    state.dispatcher.table().install(table);
    state.dispatcher.directory().reconcile(&config);
    state
        .probers
        .restart(&state.prober, state.dispatcher.directory(), &config);
    tracing::info!(version, path = %path.display(), "configuration reloaded");
    Ok(version)
}

// ── Background tasks ────────────────────────────────────────────────────

fn spawn_limiter_gc(stores: Arc<SharedStores>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMITER_GC_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let before = stores.limiters.len();
            stores.limiters.purge_idle(LIMITER_IDLE_AFTER);
            let dropped = before.saturating_sub(stores.limiters.len());
            if dropped > 0 {
                tracing::debug!(dropped, "evicted idle rate-limit buckets");
            }
        }
    });
}

/// Watches the config file's directory and funnels change events into
/// [`reload_from_file`]. A rejected file keeps the current table.
fn spawn_config_watcher(state: AppState, path: PathBuf) {
    tokio::spawn(async move {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher =
            match notify::recommended_watcher(move |outcome: Result<Event, notify::Error>| {
                if let Ok(event) = outcome {
                    let _ = tx.send(event);
                }
            }) {
                Ok(watcher) => watcher,
                Err(err) => {
                    tracing::warn!(error = %err, "config watcher unavailable");
                    return;
                }
            };

        // Watch the parent directory: editors often replace the file
        // wholesale, which would orphan a direct watch.
        let target = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => path.clone(),
        };
        if let Err(err) = watcher.watch(&target, RecursiveMode::NonRecursive) {
            tracing::warn!(error = %err, path = %target.display(), "config watch failed");
            return;
        }
        tracing::info!(path = %path.display(), "watching configuration file");

        while let Some(event) = rx.recv().await {
            let touches_file = event.paths.is_empty()
                || event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == path.file_name());
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            );
            if !relevant || !touches_file {
                continue;
            }
            tokio::time::sleep(WATCH_DEBOUNCE).await;
            while rx.try_recv().is_ok() {}
            if let Err(err) = reload_from_file(&state, &path) {
                tracing::warn!(error = %err, "watched config rejected, keeping previous table");
            }
        }
    });
}

// ===== Tests =====
