use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for the fleet controller
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControllerConfig {
    /// Autoscaler settings
    pub autoscaler: AutoscalerConfig,
    /// Worker discovery and health probing
    pub discovery: DiscoveryConfig,
    /// Balancer frontend settings
    pub balancer: BalancerConfig,
    /// Metrics exporter settings
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Autoscaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    /// Metrics backend base URL
    pub prom_url: String,
    /// Worker image reference (required)
    pub docker_image: String,
    /// Value of the `autoscale_service` label carried by fleet members
    pub fleet_label: String,
    /// Fleet floor
    pub min_instances: usize,
    /// Fleet ceiling
    pub max_instances: usize,
    /// Scale-out CPU fraction (0-1); scale-in band starts at half of it
    pub cpu_threshold: f64,
    /// Tick period in seconds; also the post-action cooldown
    pub check_interval_seconds: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            prom_url: "http://localhost:9090".to_string(),
            docker_image: String::new(),
            fleet_label: "autoscale_service".to_string(),
            min_instances: 1,
            max_instances: 10,
            cpu_threshold: 0.7,
            check_interval_seconds: 30,
        }
    }
}

/// Discovery and health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// User-defined overlay network workers are attached to
    pub network_name: String,
    /// Port workers expose `/health` and `/load` on
    pub worker_port: u16,
    /// Probe cadence in seconds
    pub probe_interval_seconds: u64,
    /// Per-probe timeout in seconds
    pub probe_timeout_seconds: u64,
    /// Window after a successful probe during which failures classify as degraded
    pub grace_seconds: u64,
    /// Retry delay when a pass discovers no workers or fails outright
    pub empty_retry_seconds: u64,
    /// Prometheus file_sd document maintained with worker scrape targets
    pub targets_path: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            network_name: "pnu_cloud_computing_mynet".to_string(),
            worker_port: 5000,
            probe_interval_seconds: 300,
            probe_timeout_seconds: 15,
            grace_seconds: 600,
            empty_retry_seconds: 30,
            targets_path: "/app/prometheus/targets/flask.json".to_string(),
        }
    }
}

/// Balancer frontend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Listen address for the public frontend
    pub listen_addr: String,
    /// Selection policy active at startup
    pub default_mode: String,
    /// Per-attempt upstream timeout in seconds
    pub forward_timeout_seconds: u64,
    /// Attempts against a single worker before moving on
    pub attempts_per_worker: u32,
    /// Worker selections before giving up with 502
    pub worker_selections: u32,
    /// Pause between attempts at the same worker, in milliseconds
    pub retry_pause_ms: u64,
    /// Declared request body limit in bytes
    pub max_body_bytes: usize,
    /// Timeout for the single `/cpu/toggle` forward, in seconds
    pub toggle_timeout_seconds: u64,
    /// Timeout when collecting upstream `/metrics` bodies, in seconds
    pub upstream_metrics_timeout_seconds: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            default_mode: "round_robin".to_string(),
            forward_timeout_seconds: 3,
            attempts_per_worker: 3,
            worker_selections: 5,
            retry_pause_ms: 100,
            max_body_bytes: 5 * 1024 * 1024,
            toggle_timeout_seconds: 5,
            upstream_metrics_timeout_seconds: 2,
        }
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter listener
    pub enabled: bool,
    /// Exporter listen address
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9091".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "controller_node=info".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from an optional TOML file plus the environment.
    ///
    /// Nested values can be set as `CONTROLLER_<SECTION>__<FIELD>`; the flat
    /// deployment variables (`PROM_URL`, `DOCKER_IMAGE`, `MIN_INSTANCES`,
    /// `MAX_INSTANCES`, `CPU_THRESHOLD`, `CHECK_INTERVAL`) override their
    /// nested counterparts afterwards.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_name =
            std::env::var("CONTROLLER_CONFIG").unwrap_or_else(|_| "config".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&config_name).required(false))
            .add_source(config::Environment::with_prefix("CONTROLLER").separator("__"))
            .build()?;

        let mut cfg: ControllerConfig = settings.try_deserialize()?;
        cfg.apply_environment_overrides()?;
        Ok(cfg)
    }

    /// Apply the flat deployment environment variables on top of the
    /// loaded configuration.
    pub fn apply_environment_overrides(&mut self) -> Result<(), config::ConfigError> {
        fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, config::ConfigError> {
            match std::env::var(name) {
                Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                    config::ConfigError::Message(format!("invalid value for {name}: {raw:?}"))
                }),
                Err(_) => Ok(None),
            }
        }

        if let Ok(url) = std::env::var("PROM_URL") {
            self.autoscaler.prom_url = url;
        }
        if let Ok(image) = std::env::var("DOCKER_IMAGE") {
            self.autoscaler.docker_image = image;
        }
        if let Some(min) = parsed::<usize>("MIN_INSTANCES")? {
            self.autoscaler.min_instances = min;
        }
        if let Some(max) = parsed::<usize>("MAX_INSTANCES")? {
            self.autoscaler.max_instances = max;
        }
        if let Some(threshold) = parsed::<f64>("CPU_THRESHOLD")? {
            self.autoscaler.cpu_threshold = threshold;
        }
        if let Some(interval) = parsed::<u64>("CHECK_INTERVAL")? {
            self.autoscaler.check_interval_seconds = interval;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.autoscaler.docker_image.is_empty() {
            return Err("DOCKER_IMAGE must be set to the worker image".to_string());
        }
        if self.autoscaler.min_instances > self.autoscaler.max_instances {
            return Err(format!(
                "MIN_INSTANCES ({}) cannot exceed MAX_INSTANCES ({})",
                self.autoscaler.min_instances, self.autoscaler.max_instances
            ));
        }
        if !(self.autoscaler.cpu_threshold > 0.0 && self.autoscaler.cpu_threshold <= 1.0) {
            return Err("CPU_THRESHOLD must be a fraction in (0, 1]".to_string());
        }
        if self.autoscaler.check_interval_seconds == 0 {
            return Err("CHECK_INTERVAL cannot be 0".to_string());
        }
        if self.discovery.worker_port == 0 {
            return Err("Worker port cannot be 0".to_string());
        }
        if self.listen_addr().is_err() {
            return Err(format!(
                "Invalid balancer listen address: {}",
                self.balancer.listen_addr
            ));
        }
        if self.balancer.worker_selections == 0 || self.balancer.attempts_per_worker == 0 {
            return Err("Retry budgets cannot be 0".to_string());
        }
        Ok(())
    }

    /// Get the balancer listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.balancer.listen_addr.parse()
    }

    /// Get the metrics exporter listen address
    pub fn metrics_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.metrics.listen_addr.parse()
    }
}

impl AutoscalerConfig {
    /// Get the tick period as a Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

impl DiscoveryConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }

    pub fn empty_retry(&self) -> Duration {
        Duration::from_secs(self.empty_retry_seconds)
    }
}

impl BalancerConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_seconds)
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn toggle_timeout(&self) -> Duration {
        Duration::from_secs(self.toggle_timeout_seconds)
    }

    pub fn upstream_metrics_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_metrics_timeout_seconds)
    }
}
