//! Endpoint selection for upstream pools.
//!
//! Each service gets one [`UpstreamState`]: an atomically swappable
//! snapshot of endpoint entries plus whatever bookkeeping the balancing
//! strategy needs (a shared cursor for round robin, per-endpoint
//! in-flight counters for least connections). Selection never locks;
//! health flips and endpoint-set changes build a new snapshot and swap
//! it in, carrying the live counters across so outstanding work is
//! never forgotten.
//!
//! Selection only ever considers endpoints currently marked
//! [`HealthState::Healthy`]. Endpoints arriving from config or a feed
//! with `Unknown` health are normalized to `Healthy` on ingest and the
//! prober takes it from there; an explicit `Unhealthy` is honored.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use gatehouse_core::{BalanceStrategy, Endpoint, EndpointAddr, HealthState, UpstreamSpec};
use rand::Rng;

// ── Endpoint entries ────────────────────────────────────────────────────

/// One endpoint as the balancer sees it.
///
/// Entries are immutable snapshots; a health flip replaces the entry.
/// The in-flight counter is shared across replacements so a rebuild in
/// the middle of a request keeps the count honest.
#[derive(Debug)]
pub struct EndpointState {
    pub addr: EndpointAddr,
    pub health: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    outstanding: Arc<AtomicUsize>,
}

impl EndpointState {
    fn fresh(addr: EndpointAddr, health: HealthState, checked: Option<DateTime<Utc>>) -> Self {
        Self {
            addr,
            health: normalize(health),
            last_checked_at: checked,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests currently being proxied to this endpoint.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn checked_key(&self) -> DateTime<Utc> {
        self.last_checked_at.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn normalize(health: HealthState) -> HealthState {
    match health {
        HealthState::Unknown => HealthState::Healthy,
        other => other,
    }
}

/// Decrements the endpoint's in-flight counter when dropped, so the
/// count stays correct even when the client walks away mid-stream.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    pub fn acquire(endpoint: &EndpointState) -> Self {
        endpoint.outstanding.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(&endpoint.outstanding),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Pool state ──────────────────────────────────────────────────────────

/// Live balancing state for one service's endpoint pool.
#[derive(Debug)]
pub struct UpstreamState {
    name: String,
    strategy: BalanceStrategy,
    endpoints: ArcSwap<Vec<Arc<EndpointState>>>,
    cursor: AtomicUsize,
}

impl UpstreamState {
    pub fn from_spec(spec: &UpstreamSpec) -> Self {
        let endpoints = spec
            .endpoints
            .iter()
            .map(|addr| Arc::new(EndpointState::fresh(addr.clone(), HealthState::Unknown, None)))
            .collect::<Vec<_>>();
        Self {
            name: spec.name.clone(),
            strategy: spec.strategy,
            endpoints: ArcSwap::from_pointee(endpoints),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    /// Current endpoint snapshot.
    pub fn endpoints(&self) -> Arc<Vec<Arc<EndpointState>>> {
        self.endpoints.load_full()
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints
            .load()
            .iter()
            .filter(|e| e.health == HealthState::Healthy)
            .count()
    }

    /// Picks a healthy endpoint per the pool's strategy, or `None` when
    /// every endpoint is down.
    pub fn select(&self) -> Option<Arc<EndpointState>> {
        let snapshot = self.endpoints.load();
        let healthy: Vec<&Arc<EndpointState>> = snapshot
            .iter()
            .filter(|e| e.health == HealthState::Healthy)
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let chosen = match self.strategy {
            BalanceStrategy::LeastConnections => healthy.iter().copied().min_by(|a, b| {
                a.outstanding()
                    .cmp(&b.outstanding())
                    .then_with(|| a.checked_key().cmp(&b.checked_key()))
            })?,
            BalanceStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..healthy.len());
                healthy[idx]
            }
            // RoundRobin, and the fallback for strategies newer than
            // this crate.
            _ => {
                let turn = self.cursor.fetch_add(1, Ordering::SeqCst);
                healthy[turn % healthy.len()]
            }
        };
        Some(Arc::clone(chosen))
    }

    /// Records a health-probe result for one endpoint. Unknown
    /// addresses are ignored.
    pub fn set_health(&self, addr: &EndpointAddr, health: HealthState, checked: DateTime<Utc>) {
        self.endpoints.rcu(|current| {
            current
                .iter()
                .map(|ep| {
                    if ep.addr == *addr {
                        Arc::new(EndpointState {
                            addr: ep.addr.clone(),
                            health,
                            last_checked_at: Some(checked),
                            outstanding: Arc::clone(&ep.outstanding),
                        })
                    } else {
                        Arc::clone(ep)
                    }
                })
                .collect::<Vec<_>>()
        });
    }

    /// Replaces the endpoint set with an authoritative feed.
    ///
    /// Health comes from the feed (`Unknown` normalized to `Healthy`);
    /// in-flight counters survive for addresses present in both sets.
    pub fn apply_feed(&self, feed: &[Endpoint]) {
        self.endpoints.rcu(|current| {
            feed.iter()
                .map(|incoming| {
                    match current.iter().find(|e| e.addr == incoming.addr) {
                        Some(existing) => Arc::new(EndpointState {
                            addr: incoming.addr.clone(),
                            health: normalize(incoming.health),
                            last_checked_at: incoming.last_checked_at.or(existing.last_checked_at),
                            outstanding: Arc::clone(&existing.outstanding),
                        }),
                        None => Arc::new(EndpointState::fresh(
                            incoming.addr.clone(),
                            incoming.health,
                            incoming.last_checked_at,
                        )),
                    }
                })
                .collect::<Vec<_>>()
        });
    }

    /// Re-shapes the pool after a config reload.
    ///
    /// Unlike [`apply_feed`](Self::apply_feed), surviving endpoints
    /// keep their current runtime health and probe timestamps; only
    /// membership changes.
    pub fn reconcile_addrs(&self, desired: &[EndpointAddr]) {
        self.endpoints.rcu(|current| {
            desired
                .iter()
                .map(|addr| match current.iter().find(|e| e.addr == *addr) {
                    Some(existing) => Arc::clone(existing),
                    None => {
                        Arc::new(EndpointState::fresh(addr.clone(), HealthState::Unknown, None))
                    }
                })
                .collect::<Vec<_>>()
        });
    }
}

// ===== Tests =====
