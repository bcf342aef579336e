//! Worker discovery and health probing.
//!
//! Enumerates running worker containers on the overlay network, probes
//! `/health`, classifies each worker, and publishes the routable set. Any
//! component may request an immediate re-run through the shared [`Notify`];
//! multiple requests collapse into a single wakeup.

use chrono::Utc;
use metrics::counter;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::balancer::{Balancer, Worker, WorkerStatus};
use crate::config::DiscoveryConfig;
use crate::error::{ControllerError, Result};
use crate::prom::TargetsFile;
use crate::runtime::ContainerRuntime;

pub struct Prober {
    runtime: Arc<dyn ContainerRuntime>,
    balancer: Arc<Balancer>,
    targets: TargetsFile,
    client: reqwest::Client,
    cfg: DiscoveryConfig,
    worker_image: String,
    refresh: Arc<Notify>,
    /// Grace log: endpoint URL → instant of the last successful probe
    last_success: HashMap<String, Instant>,
}

impl Prober {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        balancer: Arc<Balancer>,
        targets: TargetsFile,
        cfg: DiscoveryConfig,
        worker_image: String,
        refresh: Arc<Notify>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.probe_timeout())
            .build()
            .map_err(|e| ControllerError::Internal(e.to_string()))?;
        Ok(Self {
            runtime,
            balancer,
            targets,
            client,
            cfg,
            worker_image,
            refresh,
            last_success: HashMap::new(),
        })
    }

    /// One discovery pass. Returns the number of workers discovered.
    pub async fn pass(&mut self, now: Instant) -> Result<usize> {
        let containers = self
            .runtime
            .list_running_by_image(&self.worker_image)
            .await?;

        let mut workers = Vec::new();
        for container in &containers {
            let Some(ip) = container.network_ip(&self.cfg.network_name) else {
                warn!(
                    container = %container.name,
                    network = %self.cfg.network_name,
                    "worker not attached to the overlay network or has no address"
                );
                continue;
            };
            debug!(container = %container.name, ip = %ip, "discovered worker");
            workers.push(Worker {
                container_id: container.short_id().to_string(),
                container_name: container.name.clone(),
                network_ip: ip,
                endpoint_url: format!("http://{ip}:{}", self.cfg.worker_port),
                status: WorkerStatus::Unknown,
                last_latency_seconds: f64::INFINITY,
                last_success: None,
            });
        }

        if workers.is_empty() {
            warn!("no workers discovered, publishing empty routable set");
            self.last_success.clear();
            self.balancer.publish(Vec::new());
            if let Err(e) = self.targets.write(&[]) {
                warn!(error = %e, "failed to write scrape targets");
            }
            return Ok(0);
        }

        for worker in &mut workers {
            self.probe(worker, now).await;
        }

        // Drop grace entries for endpoints that vanished
        let live: Vec<String> = workers.iter().map(|w| w.endpoint_url.clone()).collect();
        self.last_success.retain(|endpoint, _| live.contains(endpoint));

        let targets: Vec<String> = workers
            .iter()
            .map(|w| format!("{}:{}", w.network_ip, self.cfg.worker_port))
            .collect();
        if let Err(e) = self.targets.write(&targets) {
            warn!(error = %e, "failed to write scrape targets");
        }

        let healthy = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .count();
        let total = workers.len();
        let generation = self.balancer.publish(workers);
        counter!("prober_passes_total", 1);
        info!(healthy, total, generation, "health check pass complete");
        if healthy == 0 {
            error!("all workers failed their health probe");
        } else if healthy < total {
            warn!(unhealthy = total - healthy, "some workers failed their health probe");
        }
        Ok(total)
    }

    async fn probe(&mut self, worker: &mut Worker, now: Instant) {
        let url = format!("{}/health", worker.endpoint_url);
        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                worker.status = WorkerStatus::Healthy;
                worker.last_latency_seconds = started.elapsed().as_secs_f64();
                worker.last_success = Some(Utc::now());
                self.last_success.insert(worker.endpoint_url.clone(), now);
                debug!(
                    container = %worker.container_name,
                    latency = worker.last_latency_seconds,
                    "worker healthy"
                );
            }
            Ok(response) => {
                warn!(
                    container = %worker.container_name,
                    status = %response.status(),
                    "worker health probe returned non-200"
                );
                self.mark_failed(worker, now);
            }
            Err(e) if e.is_timeout() => {
                warn!(container = %worker.container_name, "worker health probe timed out");
                self.mark_failed(worker, now);
            }
            Err(e) if e.is_connect() => {
                warn!(container = %worker.container_name, "worker connection failed");
                self.mark_failed(worker, now);
            }
            Err(e) => {
                warn!(container = %worker.container_name, error = %e, "worker health probe failed");
                self.mark_failed(worker, now);
            }
        }
    }

    /// Classify a failed probe: degraded while inside the grace window
    /// after a recorded success, unhealthy otherwise.
    fn mark_failed(&mut self, worker: &mut Worker, now: Instant) {
        counter!("prober_probe_failures_total", 1);
        worker.last_latency_seconds = f64::INFINITY;
        match self.last_success.get(&worker.endpoint_url) {
            Some(&succeeded) if now.duration_since(succeeded) < self.cfg.grace() => {
                worker.status = WorkerStatus::Degraded;
                warn!(
                    container = %worker.container_name,
                    "probe failed but success is recent, keeping worker as degraded"
                );
            }
            _ => {
                worker.status = WorkerStatus::Unhealthy;
            }
        }
    }

    /// Run the prober loop until cancellation. A pass that fails, or that
    /// finds no workers, retries after the short delay instead of the full
    /// cadence.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_seconds = self.cfg.probe_interval_seconds,
            grace_seconds = self.cfg.grace_seconds,
            image = %self.worker_image,
            "starting discovery loop"
        );
        loop {
            let wait = match self.pass(Instant::now()).await {
                Ok(0) => self.cfg.empty_retry(),
                Ok(_) => self.cfg.probe_interval(),
                Err(e) => {
                    error!(error = %e, "discovery pass failed");
                    self.cfg.empty_retry()
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = self.refresh.notified() => {
                    info!("immediate health check requested");
                }
            }
        }
        info!("discovery loop stopped");
    }
}
