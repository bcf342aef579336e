//! Reverse-proxy frontend for `/load`.
//!
//! Requests are forwarded to a selected worker with hop-by-hop headers
//! stripped, retried a few times against the same worker and then across
//! other workers before giving up with 502.

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::api::AppState;
use crate::config::BalancerConfig;
use crate::error::{ControllerError, Result};

/// Headers never forwarded in either direction
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "host",
    "content-length",
    "connection",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Copy of `headers` without the hop-by-hop set
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// A response read back from a worker
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    fn into_response(self) -> Response {
        (self.status, filter_headers(&self.headers), self.body).into_response()
    }
}

/// Forwarding primitive with the per-worker retry budget
#[derive(Clone)]
pub struct ProxyForwarder {
    client: reqwest::Client,
    attempts_per_worker: u32,
    worker_selections: u32,
    retry_pause: Duration,
    attempt_timeout: Duration,
    pub max_body_bytes: usize,
}

impl ProxyForwarder {
    pub fn new(cfg: &BalancerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ControllerError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            attempts_per_worker: cfg.attempts_per_worker,
            worker_selections: cfg.worker_selections,
            retry_pause: cfg.retry_pause(),
            attempt_timeout: cfg.forward_timeout(),
            max_body_bytes: cfg.max_body_bytes,
        })
    }

    async fn forward_once(
        &self,
        method: Method,
        target_url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> std::result::Result<UpstreamResponse, reqwest::Error> {
        let response = self
            .client
            .request(method, target_url)
            .headers(headers)
            .body(body)
            .timeout(self.attempt_timeout)
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    /// Try one worker up to the per-worker budget; timeouts, connection
    /// errors, and anything else all count as a failed attempt.
    async fn forward_with_retries(
        &self,
        method: &Method,
        target_url: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Option<UpstreamResponse> {
        for attempt in 1..=self.attempts_per_worker {
            debug!(target = %target_url, attempt, "forwarding request");
            match self
                .forward_once(method.clone(), target_url, headers.clone(), body.clone())
                .await
            {
                Ok(upstream) => {
                    debug!(target = %target_url, status = %upstream.status, "backend responded");
                    return Some(upstream);
                }
                Err(e) if e.is_timeout() => {
                    warn!(target = %target_url, attempt, "backend timed out");
                }
                Err(e) if e.is_connect() => {
                    warn!(target = %target_url, attempt, "backend connection failed");
                }
                Err(e) => {
                    warn!(target = %target_url, attempt, error = %e, "backend request failed");
                }
            }
            counter!("balancer_upstream_retries_total", 1);
            if attempt < self.attempts_per_worker {
                tokio::time::sleep(self.retry_pause).await;
            }
        }
        None
    }
}

/// `/load` handler: select, forward, retry across workers.
pub async fn route_load(State(state): State<AppState>, request: Request) -> Response {
    counter!("balancer_requests_total", 1);
    let started = Instant::now();

    let (parts, raw_body) = request.into_parts();
    let method = parts.method;
    let headers = parts.headers;
    let query = parts.uri.query().map(str::to_string);

    // Reject on the declared length before touching the body
    let declared_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(length) = declared_length {
        if length > state.proxy.max_body_bytes {
            warn!(length, "rejecting oversized request");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request too large").into_response();
        }
    }
    // The same cap guards chunked bodies with no declared length
    let body = match axum::body::to_bytes(raw_body, state.proxy.max_body_bytes).await {
        Ok(body) => body,
        Err(_) => {
            warn!("rejecting request with oversized undeclared body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request too large").into_response();
        }
    };

    let forward_headers = filter_headers(&headers);
    let query_suffix = query.map(|q| format!("?{q}")).unwrap_or_default();

    let mut selections = 0;
    while selections < state.proxy.worker_selections {
        let Some(worker) = state.balancer.choose() else {
            return if selections == 0 {
                error!("no healthy backend available");
                (StatusCode::SERVICE_UNAVAILABLE, "No healthy servers").into_response()
            } else {
                error!("ran out of backends mid-retry");
                (StatusCode::BAD_GATEWAY, "All backend servers unavailable").into_response()
            };
        };
        selections += 1;
        let target_url = format!("{}/load{}", worker.endpoint_url, query_suffix);
        debug!(
            backend = %worker.container_name,
            target = %target_url,
            selections,
            "selected backend"
        );

        let _in_flight = state.balancer.track(&worker.endpoint_url);
        if let Some(upstream) = state
            .proxy
            .forward_with_retries(&method, &target_url, &forward_headers, &body)
            .await
        {
            info!(
                backend = %worker.container_name,
                status = %upstream.status,
                duration_ms = started.elapsed().as_millis() as u64,
                "request completed"
            );
            return upstream.into_response();
        }

        counter!("balancer_upstream_failures_total", 1);
        warn!(backend = %worker.endpoint_url, "backend exhausted its attempts, trying another");
    }

    error!(
        selections,
        duration_ms = started.elapsed().as_millis() as u64,
        "all backend selections exhausted"
    );
    (StatusCode::BAD_GATEWAY, "All backend servers unavailable").into_response()
}
