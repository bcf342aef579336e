//! Container runtime adapter.
//!
//! Wraps the Docker Engine API behind the [`ContainerRuntime`] capability
//! trait so the autoscaler and prober can be exercised against mocks.

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, ContainerSummary, EndpointSettings, NetworkingConfig};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::error::{ControllerError, Result};

/// Docker label key identifying fleet members; its value is the configured
/// fleet label.
pub const FLEET_LABEL_KEY: &str = "autoscale_service";

/// Label marking a fleet member as excluded from autoscaled removal
pub const FIXED_LABEL_KEY: &str = "autoscale_fixed";

/// A fleet container as seen by the runtime
#[derive(Debug, Clone)]
pub struct WorkerContainer {
    /// Full container id
    pub id: String,
    /// Container name without the leading slash
    pub name: String,
    /// Creation time (unix seconds), the snapshot ordering key
    pub created: i64,
    /// Excluded from autoscaled removal
    pub fixed: bool,
    /// IPv4 per attached network
    pub networks: HashMap<String, IpAddr>,
}

impl WorkerContainer {
    /// IPv4 on the named overlay network, if attached
    pub fn network_ip(&self, network_name: &str) -> Option<IpAddr> {
        self.networks.get(network_name).copied()
    }

    /// First 12 characters of the container id
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }
}

/// Capability interface over the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fleet members carrying `autoscale_service=<label_value>`, running
    /// only, in stable creation order (oldest first).
    async fn list(&self, label_value: &str) -> Result<Vec<WorkerContainer>>;

    /// Running containers descended from the worker image, in stable
    /// creation order.
    async fn list_running_by_image(&self, image: &str) -> Result<Vec<WorkerContainer>>;

    /// Start one new fleet member; returns its container id
    async fn run(&self, image: &str, label_value: &str) -> Result<String>;

    /// Force-remove a container
    async fn remove(&self, id: &str) -> Result<()>;

    /// Force-remove every container carrying the fleet label, in any state.
    /// Returns how many were removed; per-container failures are logged.
    async fn remove_fleet(&self, label_value: &str) -> Result<usize>;

    /// Logical CPU count of the host, for CPU normalization
    fn host_cpu_count(&self) -> usize;
}

/// [`ContainerRuntime`] backed by the local Docker daemon
pub struct DockerRuntime {
    docker: Docker,
    network_name: String,
    host_cpus: usize,
}

impl DockerRuntime {
    /// Connect to the local daemon and verify it responds
    pub async fn connect(network_name: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        let host_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        info!(host_cpus, "connected to container runtime");
        Ok(Self {
            docker,
            network_name: network_name.to_string(),
            host_cpus,
        })
    }

    async fn list_with_filters(
        &self,
        all: bool,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<WorkerContainer>> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        let mut containers: Vec<WorkerContainer> = summaries
            .into_iter()
            .filter_map(Self::from_summary)
            .collect();
        // Stable creation order so scale-in tie-breaks are deterministic;
        // "last" always means the newest member.
        containers.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(containers)
    }

    /// Extract a descriptor from an API summary. A malformed entry is
    /// logged and skipped rather than aborting the enumeration.
    fn from_summary(summary: ContainerSummary) -> Option<WorkerContainer> {
        let Some(id) = summary.id else {
            warn!("container summary without an id, skipping");
            return None;
        };
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.get(..12).unwrap_or(&id).to_string());

        let labels = summary.labels.unwrap_or_default();
        let fixed = labels
            .get(FIXED_LABEL_KEY)
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let mut networks = HashMap::new();
        if let Some(settings) = summary.network_settings {
            for (network, endpoint) in settings.networks.unwrap_or_default() {
                let Some(raw) = endpoint.ip_address.as_deref().filter(|s| !s.is_empty()) else {
                    continue;
                };
                match raw.parse::<IpAddr>() {
                    Ok(ip) => {
                        networks.insert(network, ip);
                    }
                    Err(_) => {
                        warn!(container = %name, network = %network, address = %raw,
                            "unparseable container address, skipping network");
                    }
                }
            }
        }

        Some(WorkerContainer {
            id,
            name,
            created: summary.created.unwrap_or(0),
            fixed,
            networks,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self, label_value: &str) -> Result<Vec<WorkerContainer>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{FLEET_LABEL_KEY}={label_value}")],
        )]);
        self.list_with_filters(false, filters).await
    }

    async fn list_running_by_image(&self, image: &str) -> Result<Vec<WorkerContainer>> {
        let filters = HashMap::from([
            ("status".to_string(), vec!["running".to_string()]),
            ("ancestor".to_string(), vec![image.to_string()]),
        ]);
        self.list_with_filters(false, filters).await
    }

    async fn run(&self, image: &str, label_value: &str) -> Result<String> {
        let name = format!("{FLEET_LABEL_KEY}-{:08x}", rand::random::<u32>());
        let labels = HashMap::from([(FLEET_LABEL_KEY.to_string(), label_value.to_string())]);
        let endpoints = HashMap::from([(self.network_name.clone(), EndpointSettings::default())]);

        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            labels: Some(labels),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(endpoints),
            }),
            ..Default::default()
        };

        let created = match self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(name.clone()),
                    ..Default::default()
                }),
                body,
            )
            .await
        {
            Ok(created) => created,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            }) if message.contains("network") => {
                return Err(ControllerError::NetworkMissing(self.network_name.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await?;

        info!(container = %name, id = %created.id, image = %image, "started worker container");
        Ok(created.id)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        info!(id = %id, "removed worker container");
        Ok(())
    }

    async fn remove_fleet(&self, label_value: &str) -> Result<usize> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{FLEET_LABEL_KEY}={label_value}")],
        )]);
        let containers = self.list_with_filters(true, filters).await?;

        let mut removed = 0;
        for container in &containers {
            match self.remove(&container.id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(container = %container.name, error = %e, "failed to remove fleet container");
                }
            }
        }
        debug!(removed, total = containers.len(), "fleet cleanup finished");
        Ok(removed)
    }

    fn host_cpu_count(&self) -> usize {
        self.host_cpus
    }
}
