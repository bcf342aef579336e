//! Time-windowed autoscaler.
//!
//! Scale-out only after CPU stays above the threshold for the full breach
//! window; scale-in only after CPU stays below half the threshold. Each
//! tick performs at most one scale action, after which both breach timers
//! are cleared and a one-interval cooldown suppresses metric fetches.

use metrics::counter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AutoscalerConfig;
use crate::prom::{cpu_rate_query, MetricsSource};
use crate::runtime::ContainerRuntime;

/// Continuous dwell above the threshold before scale-out fires
pub const SCALE_OUT_DWELL: Duration = Duration::from_secs(3 * 60);
/// Continuous dwell below half-threshold before any member may be removed
pub const SCALE_IN_DWELL: Duration = Duration::from_secs(60);
/// Shorter dwell that removes autoscaled surplus only
pub const FAST_SCALE_IN_DWELL: Duration = Duration::from_secs(15);
/// Dwell after which a fully pinned fleet is reported
pub const STUCK_DWELL: Duration = Duration::from_secs(30);

/// The single action a tick may take
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    /// A container was started; floor enforcement or scale-out
    Started(String),
    /// A container was removed by scale-in
    Removed(String),
}

pub struct Autoscaler {
    runtime: Arc<dyn ContainerRuntime>,
    metrics: Arc<dyn MetricsSource>,
    cfg: AutoscalerConfig,
    /// Wakes the prober right after a scale action
    refresh: Arc<Notify>,
    above_since: Option<Instant>,
    below_since: Option<Instant>,
    last_scale_time: Option<Instant>,
}

impl Autoscaler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<dyn MetricsSource>,
        cfg: AutoscalerConfig,
        refresh: Arc<Notify>,
    ) -> Self {
        Self {
            runtime,
            metrics,
            cfg,
            refresh,
            above_since: None,
            below_since: None,
            last_scale_time: None,
        }
    }

    /// Breach timers `(above_since, below_since)`
    pub fn breach_timers(&self) -> (Option<Instant>, Option<Instant>) {
        (self.above_since, self.below_since)
    }

    pub fn last_scale_time(&self) -> Option<Instant> {
        self.last_scale_time
    }

    /// One control pass: floor → cooldown → fetch → scale-out → scale-in.
    pub async fn tick(&mut self, now: Instant) -> crate::error::Result<Option<ScaleAction>> {
        let containers = self.runtime.list(&self.cfg.fleet_label).await?;
        let count = containers.len();

        // Floor enforcement bypasses the cooldown
        if count < self.cfg.min_instances {
            info!(
                count,
                min = self.cfg.min_instances,
                "fleet below floor, starting container"
            );
            let id = self
                .runtime
                .run(&self.cfg.docker_image, &self.cfg.fleet_label)
                .await?;
            counter!("autoscaler_scale_out_total", 1);
            return Ok(Some(self.record_action(ScaleAction::Started(id), now)));
        }

        // Let the metrics backend observe the new fleet before acting again
        if let Some(last) = self.last_scale_time {
            if now.duration_since(last) < self.cfg.check_interval() {
                debug!("within cooldown, skipping metric fetch");
                return Ok(None);
            }
        }

        let raw = match self
            .metrics
            .query_scalar(&cpu_rate_query(&self.cfg.fleet_label))
            .await
        {
            Ok(value) => value,
            Err(e) => {
                // Transient metrics outage: keep accumulated dwell intact
                warn!(error = %e, "CPU metric fetch failed, skipping cycle");
                return Ok(None);
            }
        };

        let host_cpus = self.runtime.host_cpu_count().max(1);
        let avg_cpu = if count > 0 {
            raw / (count * host_cpus) as f64 * 100.0
        } else {
            0.0
        };
        info!(avg_cpu, count, "average fleet CPU (normalized single-core %)");

        let out_band = self.cfg.cpu_threshold * 100.0;
        let in_band = out_band / 2.0;

        // Scale-out band: strictly above the threshold
        if avg_cpu > out_band {
            match self.above_since {
                None => {
                    self.above_since = Some(now);
                    debug!("CPU above threshold, scale-out timer started");
                }
                Some(since)
                    if now.duration_since(since) >= SCALE_OUT_DWELL
                        && count < self.cfg.max_instances =>
                {
                    info!(
                        dwell_secs = now.duration_since(since).as_secs(),
                        "CPU above threshold for the full window, scaling out by 1"
                    );
                    let id = self
                        .runtime
                        .run(&self.cfg.docker_image, &self.cfg.fleet_label)
                        .await?;
                    counter!("autoscaler_scale_out_total", 1);
                    return Ok(Some(self.record_action(ScaleAction::Started(id), now)));
                }
                Some(_) => {}
            }
        } else if self.above_since.take().is_some() {
            debug!("CPU back under threshold, scale-out timer cleared");
        }

        // Scale-in band: strictly below half the threshold
        if avg_cpu < in_band {
            let Some(since) = self.below_since else {
                self.below_since = Some(now);
                debug!("CPU below half-threshold, scale-in timer started");
                return Ok(None);
            };
            let dwell = now.duration_since(since);
            let removable = count > self.cfg.min_instances;
            let last_is_autoscaled = containers.last().map(|c| !c.fixed).unwrap_or(false);

            if dwell >= SCALE_IN_DWELL && removable && last_is_autoscaled {
                // count > min checked above, so last() exists
                let target = &containers[count - 1];
                info!(
                    container = %target.name,
                    dwell_secs = dwell.as_secs(),
                    "CPU below half-threshold past the window, scaling in by 1"
                );
                self.runtime.remove(&target.id).await?;
                counter!("autoscaler_scale_in_total", 1);
                return Ok(Some(
                    self.record_action(ScaleAction::Removed(target.id.clone()), now),
                ));
            }

            let autoscaled_last = containers.iter().rev().find(|c| !c.fixed);
            if dwell >= FAST_SCALE_IN_DWELL && removable {
                if let Some(target) = autoscaled_last {
                    info!(
                        container = %target.name,
                        dwell_secs = dwell.as_secs(),
                        "removing autoscaled surplus container"
                    );
                    self.runtime.remove(&target.id).await?;
                    counter!("autoscaler_scale_in_total", 1);
                    return Ok(Some(
                        self.record_action(ScaleAction::Removed(target.id.clone()), now),
                    ));
                }
            }

            if dwell >= STUCK_DWELL {
                info!("CPU below half-threshold but no removable container");
            }
        } else if self.below_since.take().is_some() {
            debug!("CPU back above half-threshold, scale-in timer cleared");
        }

        Ok(None)
    }

    /// Stamp the cooldown, clear both breach timers, and wake the prober
    fn record_action(&mut self, action: ScaleAction, now: Instant) -> ScaleAction {
        self.above_since = None;
        self.below_since = None;
        self.last_scale_time = Some(now);
        self.refresh.notify_one();
        action
    }

    /// Run the tick loop until cancellation. Tick errors are logged and the
    /// loop continues.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_seconds = self.cfg.check_interval_seconds,
            min_instances = self.cfg.min_instances,
            max_instances = self.cfg.max_instances,
            cpu_threshold = self.cfg.cpu_threshold,
            "starting autoscaler loop"
        );
        loop {
            if let Err(e) = self.tick(Instant::now()).await {
                error!(error = %e, "autoscaler tick failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.check_interval()) => {}
            }
        }
        info!("autoscaler loop stopped");
    }
}
