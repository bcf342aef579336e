//! Shared fixtures: mock runtime/metrics adapters and throwaway HTTP
//! workers on ephemeral ports.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use controller_node::api::{self, AppState};
use controller_node::balancer::{Balancer, Worker, WorkerStatus};
use controller_node::config::BalancerConfig;
use controller_node::error::{ControllerError, Result};
use controller_node::prom::MetricsSource;
use controller_node::runtime::{ContainerRuntime, WorkerContainer};

/// In-memory [`ContainerRuntime`] with scripted fleet state
pub struct MockRuntime {
    pub containers: Mutex<Vec<WorkerContainer>>,
    pub run_calls: AtomicUsize,
    pub removed: Mutex<Vec<String>>,
    next_created: AtomicUsize,
    cpus: usize,
}

impl MockRuntime {
    pub fn new(cpus: usize) -> Self {
        Self {
            containers: Mutex::new(Vec::new()),
            run_calls: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
            next_created: AtomicUsize::new(1000),
            cpus,
        }
    }

    /// Seed the fleet with `(name, fixed)` members in creation order
    pub fn with_fleet(cpus: usize, members: &[(&str, bool)]) -> Arc<Self> {
        let runtime = Self::new(cpus);
        for (name, fixed) in members {
            runtime.push(name, *fixed, HashMap::new());
        }
        Arc::new(runtime)
    }

    pub fn push(&self, name: &str, fixed: bool, networks: HashMap<String, std::net::IpAddr>) {
        let created = self.next_created.fetch_add(1, Ordering::SeqCst) as i64;
        self.containers.lock().unwrap().push(WorkerContainer {
            id: format!("{name}-id"),
            name: name.to_string(),
            created,
            fixed,
            networks,
        });
    }

    pub fn count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.containers.lock().unwrap().clear();
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list(&self, _label_value: &str) -> Result<Vec<WorkerContainer>> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn list_running_by_image(&self, _image: &str) -> Result<Vec<WorkerContainer>> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn run(&self, _image: &str, _label_value: &str) -> Result<String> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        let created = self.next_created.fetch_add(1, Ordering::SeqCst) as i64;
        let id = format!("started-{created}");
        self.containers.lock().unwrap().push(WorkerContainer {
            id: id.clone(),
            name: id.clone(),
            created,
            fixed: false,
            networks: HashMap::new(),
        });
        Ok(id)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.containers.lock().unwrap().retain(|c| c.id != id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove_fleet(&self, _label_value: &str) -> Result<usize> {
        let mut containers = self.containers.lock().unwrap();
        let removed = containers.len();
        containers.clear();
        Ok(removed)
    }

    fn host_cpu_count(&self) -> usize {
        self.cpus
    }
}

/// Scripted [`MetricsSource`]: a fixed raw value or a forced failure
pub struct MockMetrics {
    pub raw: Mutex<f64>,
    pub fail: AtomicBool,
    pub queries: AtomicUsize,
}

impl MockMetrics {
    pub fn returning(raw: f64) -> Arc<Self> {
        Arc::new(Self {
            raw: Mutex::new(raw),
            fail: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        })
    }

    pub fn set_raw(&self, raw: f64) {
        *self.raw.lock().unwrap() = raw;
    }

    /// Raw CPU-seconds/sec that normalizes to `pct` for `count` single-CPU
    /// containers
    pub fn raw_for(pct: f64, count: usize) -> f64 {
        pct * count as f64 / 100.0
    }
}

#[async_trait]
impl MetricsSource for MockMetrics {
    async fn query_scalar(&self, _expr: &str) -> Result<f64> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ControllerError::MetricFetchFailed(
                "scripted failure".to_string(),
            ));
        }
        Ok(*self.raw.lock().unwrap())
    }
}

// ─── throwaway HTTP workers ───────────────────────────────────────────────

#[derive(Clone)]
struct WorkerServerState {
    hits: Arc<AtomicUsize>,
    health_status: StatusCode,
}

pub struct WorkerHandle {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn kill(&self) {
        self.task.abort();
    }

    pub fn endpoint_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn worker_health(State(state): State<WorkerServerState>) -> Response {
    (state.health_status, "OK").into_response()
}

async fn worker_load(
    State(state): State<WorkerServerState>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let mut echo = HeaderMap::new();
    echo.insert("x-upstream", HeaderValue::from_static("yes"));
    // Deliberately hop-by-hop: the balancer must strip it from the response
    echo.insert(
        "proxy-authenticate",
        HeaderValue::from_static("Basic realm=\"worker\""),
    );
    echo.insert(
        "x-echo-method",
        HeaderValue::from_str(method.as_str()).unwrap(),
    );
    if let Some(query) = query {
        echo.insert("x-echo-query", HeaderValue::from_str(&query).unwrap());
    }
    echo.insert(
        "x-saw-proxy-auth",
        HeaderValue::from_str(&headers.contains_key("proxy-authorization").to_string()).unwrap(),
    );
    echo.insert(
        "x-saw-client-header",
        HeaderValue::from_str(&headers.contains_key("x-client").to_string()).unwrap(),
    );
    (StatusCode::OK, echo, "ok").into_response()
}

/// Start a worker that answers `/health` with the given status
pub async fn spawn_worker(health_status: StatusCode) -> WorkerHandle {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = WorkerServerState {
        hits: hits.clone(),
        health_status,
    };
    let app = Router::new()
        .route("/health", get(worker_health))
        .route("/load", any(worker_load))
        .route(
            "/metrics",
            get(|| async { "# HELP worker_requests_total requests\nworker_requests_total 1\n" }),
        )
        .route("/cpu/toggle", post(|| async { "cpu load toggled" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    WorkerHandle { addr, hits, task }
}

/// An address nothing listens on
pub async fn dead_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Start the balancer frontend around the given state
pub async fn spawn_frontend(balancer: Arc<Balancer>) -> SocketAddr {
    let cfg = BalancerConfig::default();
    let state = AppState::new(balancer, &cfg).unwrap();
    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Routable-set entry pointing at a test worker address
pub fn routable_worker(name: &str, addr: SocketAddr, status: WorkerStatus, latency: f64) -> Worker {
    Worker {
        container_id: format!("{name}-id"),
        container_name: name.to_string(),
        network_ip: addr.ip(),
        endpoint_url: format!("http://{addr}"),
        status,
        last_latency_seconds: latency,
        last_success: None,
    }
}
