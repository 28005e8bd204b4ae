//! Upstream directory and endpoint health probing.
//!
//! The [`UpstreamDirectory`] maps service names to their live balancing
//! state. It is built from config at startup, reconciled in place on
//! reload (surviving services keep their runtime health and in-flight
//! counters), and optionally fed by an external discovery source via
//! [`apply_feed`](UpstreamDirectory::apply_feed).
//!
//! Services that configure a `health_check` get a [`HealthProber`]
//! task: every interval it GETs the configured path on each endpoint
//! and flips the endpoint's health on the result. A 2xx/3xx answer
//! within the probe timeout counts as healthy; anything else, including
//! connect failures and timeouts, marks the endpoint unhealthy. The
//! balancer reacts on the next selection; no request is ever routed to
//! an endpoint after its probe failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gatehouse_core::{Endpoint, GatewayConfig, HealthCheckSpec, HealthState};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::balancer::{EndpointState, UpstreamState};

// ── Directory ───────────────────────────────────────────────────────────

/// All upstream pools, by service name.
#[derive(Debug, Default)]
pub struct UpstreamDirectory {
    services: DashMap<String, Arc<UpstreamState>>,
}

impl UpstreamDirectory {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let directory = Self::default();
        for spec in &config.services {
            directory
                .services
                .insert(spec.name.clone(), Arc::new(UpstreamState::from_spec(spec)));
        }
        directory
    }

    pub fn service(&self, name: &str) -> Option<Arc<UpstreamState>> {
        self.services.get(name).map(|entry| Arc::clone(&entry))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Per-service `(name, healthy, total)` counts, sorted by name.
    pub fn health_summary(&self) -> Vec<(String, usize, usize)> {
        let mut summary: Vec<(String, usize, usize)> = self
            .services
            .iter()
            .map(|entry| {
                let state = entry.value();
                (
                    entry.key().clone(),
                    state.healthy_count(),
                    state.endpoints().len(),
                )
            })
            .collect();
        summary.sort();
        summary
    }

    /// Replaces one service's endpoint set from a discovery feed.
    /// Returns `false` when the service is not configured.
    pub fn apply_feed(&self, service: &str, endpoints: &[Endpoint]) -> bool {
        match self.service(service) {
            Some(state) => {
                state.apply_feed(endpoints);
                tracing::info!(
                    service,
                    endpoints = endpoints.len(),
                    "endpoint feed applied"
                );
                true
            }
            None => false,
        }
    }

    /// Brings the directory in line with a reloaded config.
    ///
    /// Surviving services keep their runtime state; a strategy change
    /// rebuilds the pool from scratch; removed services are dropped.
    pub fn reconcile(&self, config: &GatewayConfig) {
        for spec in &config.services {
            match self.services.entry(spec.name.clone()) {
                Entry::Occupied(mut entry) => {
                    if entry.get().strategy() == spec.strategy {
                        entry.get().reconcile_addrs(&spec.endpoints);
                    } else {
                        entry.insert(Arc::new(UpstreamState::from_spec(spec)));
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(UpstreamState::from_spec(spec)));
                }
            }
        }
        self.services
            .retain(|name, _| config.services.iter().any(|s| s.name == *name));
    }
}

// ── Probing ─────────────────────────────────────────────────────────────

/// Spawns and owns the HTTP client for active health checks.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Starts the probe loop for one service. The task runs until
    /// aborted; membership changes are picked up each round because the
    /// loop re-reads the endpoint snapshot.
    pub fn spawn(&self, upstream: Arc<UpstreamState>, check: HealthCheckSpec) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(check.interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = upstream.endpoints();
                let probes = snapshot
                    .iter()
                    .map(|endpoint| probe_one(&client, &upstream, endpoint, &check));
                futures::future::join_all(probes).await;
            }
        })
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

async fn probe_one(
    client: &reqwest::Client,
    upstream: &UpstreamState,
    endpoint: &EndpointState,
    check: &HealthCheckSpec,
) {
    let url = format!("{}{}", endpoint.addr.base_url(), check.path);
    let outcome = client
        .get(&url)
        .timeout(Duration::from_millis(check.timeout_ms))
        .send()
        .await;
    let health = match outcome {
        Ok(response) if response.status().is_success() || response.status().is_redirection() => {
            HealthState::Healthy
        }
        Ok(_) | Err(_) => HealthState::Unhealthy,
    };
    if health != endpoint.health {
        tracing::info!(
            service = upstream.name(),
            endpoint = %endpoint.addr,
            from = ?endpoint.health,
            to = ?health,
            "endpoint health changed"
        );
    }
    upstream.set_health(&endpoint.addr, health, Utc::now());
}

/// The set of running probe tasks, restarted wholesale on reload.
#[derive(Debug, Default)]
pub struct ProberSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts every running probe and starts fresh ones for each
    /// service in `config` that asks for health checking.
    pub fn restart(
        &self,
        prober: &HealthProber,
        directory: &UpstreamDirectory,
        config: &GatewayConfig,
    ) {
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            handle.abort();
        }
        for spec in &config.services {
            let Some(check) = spec.health_check.clone() else {
                continue;
            };
            let Some(state) = directory.service(&spec.name) else {
                continue;
            };
            handles.push(prober.spawn(state, check));
        }
    }

    pub fn active(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn shutdown(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

// ===== Tests =====
