use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use controller_node::api::{self, AppState};
use controller_node::autoscaler::Autoscaler;
use controller_node::balancer::{Balancer, SelectionPolicy};
use controller_node::config::ControllerConfig;
use controller_node::discovery::Prober;
use controller_node::prom::{PromClient, TargetsFile};
use controller_node::runtime::{ContainerRuntime, DockerRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::load().context("failed to load configuration")?;

    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.clone().into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!(
        "Starting Fleet Controller v{} - autoscaler + load balancer",
        env!("CARGO_PKG_VERSION")
    );

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    info!(
        image = %config.autoscaler.docker_image,
        fleet_label = %config.autoscaler.fleet_label,
        network = %config.discovery.network_name,
        min = config.autoscaler.min_instances,
        max = config.autoscaler.max_instances,
        "configuration loaded"
    );

    let default_policy: SelectionPolicy = config
        .balancer
        .default_mode
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid default selection mode: {e}"))?;

    // Bootstrap collaborators; an unreachable runtime is an unrecoverable
    // bootstrap error and exits non-zero.
    let runtime = Arc::new(
        DockerRuntime::connect(&config.discovery.network_name)
            .await
            .context("container runtime unavailable")?,
    );
    let prom = Arc::new(
        PromClient::new(&config.autoscaler.prom_url, Duration::from_secs(10))
            .context("failed to build metrics client")?,
    );
    let targets = TargetsFile::new(
        &config.discovery.targets_path,
        &config.autoscaler.fleet_label,
    );
    if let Err(e) = targets.clear() {
        warn!(error = %e, "could not reset scrape targets at bootstrap");
    }

    initialize_metrics();
    if config.metrics.enabled {
        let addr = config
            .metrics_addr()
            .context("invalid metrics listen address")?;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_exporter(addr).await {
                error!(error = %e, "failed to start metrics exporter");
            }
        });
    }

    let balancer = Arc::new(Balancer::new(default_policy));
    let refresh = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    let scaler = Autoscaler::new(
        runtime.clone() as Arc<dyn ContainerRuntime>,
        prom,
        config.autoscaler.clone(),
        refresh.clone(),
    );
    tokio::spawn(scaler.run(cancel.clone()));

    let prober = Prober::new(
        runtime.clone() as Arc<dyn ContainerRuntime>,
        balancer.clone(),
        targets.clone(),
        config.discovery.clone(),
        config.autoscaler.docker_image.clone(),
        refresh.clone(),
    )
    .map_err(|e| anyhow::anyhow!("failed to build prober: {e}"))?;
    tokio::spawn(prober.run(cancel.clone()));

    let state = AppState::new(balancer, &config.balancer)
        .map_err(|e| anyhow::anyhow!("failed to build balancer state: {e}"))?;
    let app = api::router(state);

    let listen_addr = config.listen_addr().context("invalid listen address")?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(listen_addr = %listen_addr, "balancer frontend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("balancer frontend failed")?;

    // Frontend drained and loops cancelled; tear down everything we own
    info!("removing fleet containers");
    match runtime.remove_fleet(&config.autoscaler.fleet_label).await {
        Ok(removed) => info!(removed, "fleet containers removed"),
        Err(e) => error!(error = %e, "failed to remove fleet containers"),
    }
    if let Err(e) = targets.clear() {
        warn!(error = %e, "could not reset scrape targets on shutdown");
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, cancelling the background loops
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("termination signal received, draining");
    cancel.cancel();
}

/// Initialize metrics descriptions
fn initialize_metrics() {
    describe_counter!(
        "balancer_requests_total",
        "Total client requests accepted at /load"
    );
    describe_counter!(
        "balancer_upstream_retries_total",
        "Total failed upstream attempts that were retried"
    );
    describe_counter!(
        "balancer_upstream_failures_total",
        "Total workers that exhausted their attempt budget"
    );
    describe_counter!(
        "autoscaler_scale_out_total",
        "Total containers started by the autoscaler"
    );
    describe_counter!(
        "autoscaler_scale_in_total",
        "Total containers removed by the autoscaler"
    );
    describe_counter!("prober_passes_total", "Total completed discovery passes");
    describe_counter!(
        "prober_probe_failures_total",
        "Total failed worker health probes"
    );
    describe_gauge!(
        "backend_servers_total",
        "Workers discovered in the last probe pass"
    );
    describe_gauge!(
        "backend_servers_healthy",
        "Workers healthy in the last probe pass"
    );
}

/// Start the Prometheus exporter listener
async fn start_metrics_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(metrics_addr = %addr, "metrics exporter listening");
    Ok(())
}
