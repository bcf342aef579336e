//! Balancer HTTP surface: the `/load` proxy plus control and
//! introspection endpoints.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, on, post, MethodFilter};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::balancer::{Balancer, SelectionPolicy, WorkerStatus, AVAILABLE_MODES};
use crate::config::BalancerConfig;
use crate::error::Result;
use crate::proxy::{self, ProxyForwarder};

/// Shared state injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<Balancer>,
    pub proxy: ProxyForwarder,
    /// Client for `/cpu/toggle` forwards and upstream `/metrics` collection
    pub control_client: reqwest::Client,
    pub toggle_timeout: Duration,
    pub upstream_metrics_timeout: Duration,
}

impl AppState {
    pub fn new(balancer: Arc<Balancer>, cfg: &BalancerConfig) -> Result<Self> {
        Ok(Self {
            balancer,
            proxy: ProxyForwarder::new(cfg)?,
            control_client: reqwest::Client::new(),
            toggle_timeout: cfg.toggle_timeout(),
            upstream_metrics_timeout: cfg.upstream_metrics_timeout(),
        })
    }
}

/// Build the balancer router
pub fn router(state: AppState) -> Router {
    let load_methods = MethodFilter::GET
        .or(MethodFilter::POST)
        .or(MethodFilter::PUT)
        .or(MethodFilter::DELETE)
        .or(MethodFilter::PATCH);

    Router::new()
        .route("/load", on(load_methods, proxy::route_load))
        .route("/cpu/toggle", post(cpu_toggle))
        .route("/set_mode/:mode", get(set_mode))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics_endpoint))
        .route("/favicon.ico", get(favicon))
        .route("/", get(index))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Forward one `/cpu/toggle` to a chosen worker
async fn cpu_toggle(State(state): State<AppState>) -> Response {
    let Some(worker) = state.balancer.choose() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "No healthy servers").into_response();
    };
    let target_url = format!("{}/cpu/toggle", worker.endpoint_url);
    info!(backend = %worker.container_name, "forwarding CPU toggle");

    match state
        .control_client
        .post(&target_url)
        .timeout(state.toggle_timeout)
        .send()
        .await
    {
        Ok(response) => {
            let status = response.status();
            match response.bytes().await {
                Ok(body) => (status, body).into_response(),
                Err(e) => {
                    error!(backend = %target_url, error = %e, "CPU toggle body read failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Backend error").into_response()
                }
            }
        }
        Err(e) => {
            error!(backend = %target_url, error = %e, "CPU toggle forward failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Backend error").into_response()
        }
    }
}

/// Switch the selection policy
async fn set_mode(State(state): State<AppState>, Path(mode): Path<String>) -> Response {
    match mode.parse::<SelectionPolicy>() {
        Ok(policy) => {
            let previous = state.balancer.set_policy(policy);
            (
                StatusCode::OK,
                Json(json!({
                    "message": format!("Selection mode set to {mode}"),
                    "previous_mode": previous.as_str(),
                    "available_modes": AVAILABLE_MODES,
                })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(mode = %mode, error = %e, "invalid selection mode requested");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Invalid mode",
                    "available_modes": AVAILABLE_MODES,
                })),
            )
                .into_response()
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

/// Balancer state plus the last probe report
async fn status(State(state): State<AppState>) -> Response {
    let probed = state.balancer.probed();
    let set = state.balancer.routable();
    let healthy = probed
        .iter()
        .filter(|w| w.status == WorkerStatus::Healthy)
        .count();

    let servers: Vec<serde_json::Value> = probed
        .iter()
        .map(|w| {
            json!({
                "host": w.endpoint_url,
                "status": w.status.as_str(),
                "latency": w.last_latency_seconds.is_finite().then_some(w.last_latency_seconds),
                "container_name": w.container_name,
                "last_success": w.last_success,
            })
        })
        .collect();

    Json(json!({
        "load_balancer": {
            "status": "healthy",
            "mode": state.balancer.policy().as_str(),
            "generation": set.generation,
            "timestamp": chrono::Utc::now(),
        },
        "backend_servers": {
            "total": probed.len(),
            "healthy": healthy,
            "servers": servers,
        },
    }))
    .into_response()
}

/// Balancer gauges followed by the concatenated upstream `/metrics` bodies
async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    let probed = state.balancer.probed();
    let healthy: Vec<_> = probed
        .iter()
        .filter(|w| w.status == WorkerStatus::Healthy)
        .collect();

    let mut output = format!(
        "# HELP backend_servers_total Total number of backend servers\n\
         # TYPE backend_servers_total gauge\n\
         backend_servers_total {}\n\
         \n\
         # HELP backend_servers_healthy Number of healthy backend servers\n\
         # TYPE backend_servers_healthy gauge\n\
         backend_servers_healthy {}\n\
         \n\
         # HELP load_balancer_uptime Load balancer uptime in seconds\n\
         # TYPE load_balancer_uptime gauge\n\
         load_balancer_uptime {:.3}\n\n",
        probed.len(),
        healthy.len(),
        state.balancer.uptime_seconds(),
    );

    for worker in healthy {
        let url = format!("{}/metrics", worker.endpoint_url);
        match state
            .control_client
            .get(&url)
            .timeout(state.upstream_metrics_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(text) => {
                    output.push_str(&format!("# Backend: {}\n{}\n", worker.endpoint_url, text));
                }
                Err(e) => debug!(backend = %url, error = %e, "upstream metrics body read failed"),
            },
            Ok(response) => {
                debug!(backend = %url, status = %response.status(), "upstream metrics unavailable");
            }
            Err(e) => debug!(backend = %url, error = %e, "upstream metrics fetch failed"),
        }
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (StatusCode::OK, headers, output).into_response()
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Endpoint index; never proxied to a backend
async fn index(State(state): State<AppState>) -> Response {
    let probed = state.balancer.probed();
    let healthy = probed
        .iter()
        .filter(|w| w.status == WorkerStatus::Healthy)
        .count();

    Json(json!({
        "message": "Fleet Controller Load Balancer",
        "total_backends": probed.len(),
        "healthy_backends": healthy,
        "endpoints": {
            "load_balancing": "/load",
            "status": "/status",
            "health": "/health",
            "metrics": "/metrics",
            "set_mode": "/set_mode/<mode>",
            "cpu_toggle": "/cpu/toggle",
        },
    }))
    .into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Endpoint not found").into_response()
}
