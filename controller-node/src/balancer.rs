//! Routable-set state and worker selection.
//!
//! The prober is the only writer: it publishes immutable snapshots through
//! an [`ArcSwap`] so request handlers never take a lock across I/O. The
//! round-robin cursor and the active policy are plain atomics.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::gauge;
use rand::Rng;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::error::ControllerError;

/// Probe classification for a discovered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Discovered but not yet probed
    Unknown,
    /// Last probe answered 200
    Healthy,
    /// Last probe failed but a success is still within the grace window
    Degraded,
    /// Last probe failed with no recent success
    Unhealthy,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Unknown => "unknown",
            WorkerStatus::Healthy => "healthy",
            WorkerStatus::Degraded => "degraded",
            WorkerStatus::Unhealthy => "unhealthy",
        }
    }

    /// Eligible to receive client traffic
    pub fn is_routable(&self) -> bool {
        matches!(self, WorkerStatus::Healthy | WorkerStatus::Degraded)
    }
}

/// A discovered worker container and its probe state
#[derive(Debug, Clone)]
pub struct Worker {
    /// Short container id
    pub container_id: String,
    /// Container name
    pub container_name: String,
    /// IPv4 on the overlay network
    pub network_ip: IpAddr,
    /// Base URL requests are forwarded to, e.g. `http://10.0.0.3:5000`
    pub endpoint_url: String,
    /// Last probe classification
    pub status: WorkerStatus,
    /// Last probe latency; infinite when the probe failed
    pub last_latency_seconds: f64,
    /// Wall-clock time of the last successful probe
    pub last_success: Option<DateTime<Utc>>,
}

/// Snapshot of workers eligible for routing
#[derive(Debug, Default)]
pub struct RoutableSet {
    /// Routable workers in discovery order
    pub workers: Vec<Worker>,
    /// Incremented on every publish
    pub generation: u64,
}

/// Worker selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SelectionPolicy {
    RoundRobin = 0,
    Latency = 1,
    LeastConnections = 2,
    Weighted = 3,
}

/// Mode names accepted by `/set_mode`
pub const AVAILABLE_MODES: [&str; 4] =
    ["round_robin", "latency", "least_connections", "weighted"];

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::RoundRobin => "round_robin",
            SelectionPolicy::Latency => "latency",
            SelectionPolicy::LeastConnections => "least_connections",
            SelectionPolicy::Weighted => "weighted",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SelectionPolicy::Latency,
            2 => SelectionPolicy::LeastConnections,
            3 => SelectionPolicy::Weighted,
            _ => SelectionPolicy::RoundRobin,
        }
    }
}

impl std::str::FromStr for SelectionPolicy {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(SelectionPolicy::RoundRobin),
            "latency" => Ok(SelectionPolicy::Latency),
            "least_connections" => Ok(SelectionPolicy::LeastConnections),
            "weighted" => Ok(SelectionPolicy::Weighted),
            other => Err(ControllerError::InvalidPolicy(other.to_string())),
        }
    }
}

impl std::fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrements the per-worker in-flight counter when dropped
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Owned balancer state: routable snapshot, selection cursor, policy,
/// and in-flight accounting.
pub struct Balancer {
    routable: ArcSwap<RoutableSet>,
    probed: ArcSwap<Vec<Worker>>,
    cursor: AtomicUsize,
    policy: AtomicU8,
    in_flight: DashMap<String, Arc<AtomicUsize>>,
    started_at: Instant,
}

impl Balancer {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            routable: ArcSwap::from_pointee(RoutableSet::default()),
            probed: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicUsize::new(0),
            policy: AtomicU8::new(policy as u8),
            in_flight: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Replace the published snapshots with the results of a probe pass.
    ///
    /// Only healthy and degraded workers enter the routable set; the full
    /// probe report stays available for introspection. Returns the new
    /// generation.
    pub fn publish(&self, probed: Vec<Worker>) -> u64 {
        let routable: Vec<Worker> = probed
            .iter()
            .filter(|w| w.status.is_routable())
            .cloned()
            .collect();
        let healthy = probed
            .iter()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .count();
        let generation = self.routable.load().generation + 1;

        gauge!("backend_servers_total", probed.len() as f64);
        gauge!("backend_servers_healthy", healthy as f64);

        let live: HashSet<String> = probed.iter().map(|w| w.endpoint_url.clone()).collect();
        self.in_flight.retain(|endpoint, _| live.contains(endpoint));

        self.probed.store(Arc::new(probed));
        self.routable.store(Arc::new(RoutableSet {
            workers: routable,
            generation,
        }));
        generation
    }

    /// Current routable snapshot
    pub fn routable(&self) -> Arc<RoutableSet> {
        self.routable.load_full()
    }

    /// Full result of the most recent probe pass, including unroutable workers
    pub fn probed(&self) -> Arc<Vec<Worker>> {
        self.probed.load_full()
    }

    pub fn policy(&self) -> SelectionPolicy {
        SelectionPolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    /// Switch the selection policy, returning the previous one
    pub fn set_policy(&self, policy: SelectionPolicy) -> SelectionPolicy {
        let previous =
            SelectionPolicy::from_u8(self.policy.swap(policy as u8, Ordering::Relaxed));
        if previous != policy {
            info!(from = previous.as_str(), to = policy.as_str(), "selection mode changed");
        }
        previous
    }

    /// Pick the next worker under the active policy, or `None` when the
    /// routable set is empty.
    pub fn choose(&self) -> Option<Worker> {
        let set = self.routable.load_full();
        let workers = &set.workers;
        if workers.is_empty() {
            return None;
        }
        let chosen = match self.policy() {
            SelectionPolicy::RoundRobin => {
                let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
                &workers[cursor % workers.len()]
            }
            SelectionPolicy::Latency => min_by_latency(workers),
            SelectionPolicy::LeastConnections => {
                let mut best = &workers[0];
                let mut best_count = self.in_flight_count(&best.endpoint_url);
                for w in &workers[1..] {
                    let count = self.in_flight_count(&w.endpoint_url);
                    if count < best_count {
                        best = w;
                        best_count = count;
                    }
                }
                best
            }
            SelectionPolicy::Weighted => weighted_pick(workers),
        };
        Some(chosen.clone())
    }

    /// Count a request against the worker until the guard drops
    pub fn track(&self, endpoint_url: &str) -> InFlightGuard {
        let counter = self
            .in_flight
            .entry(endpoint_url.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counter }
    }

    pub fn in_flight_count(&self, endpoint_url: &str) -> usize {
        self.in_flight
            .get(endpoint_url)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// First worker with the strictly smallest latency; degraded workers carry
/// infinite latency and therefore always lose to a finite one.
fn min_by_latency(workers: &[Worker]) -> &Worker {
    let mut best = &workers[0];
    for w in &workers[1..] {
        if w.last_latency_seconds < best.last_latency_seconds {
            best = w;
        }
    }
    best
}

/// Random selection weighted by inverse latency. Workers without a finite
/// latency get a floor weight so they stay reachable but rarely picked.
fn weighted_pick(workers: &[Worker]) -> &Worker {
    const FLOOR_WEIGHT: f64 = 1e-3;
    let weights: Vec<f64> = workers
        .iter()
        .map(|w| {
            if w.last_latency_seconds.is_finite() {
                1.0 / (FLOOR_WEIGHT + w.last_latency_seconds)
            } else {
                FLOOR_WEIGHT
            }
        })
        .collect();
    let total: f64 = weights.iter().sum();
    let mut point = rand::thread_rng().gen::<f64>() * total;
    for (worker, weight) in workers.iter().zip(&weights) {
        point -= weight;
        if point <= 0.0 {
            return worker;
        }
    }
    &workers[workers.len() - 1]
}
