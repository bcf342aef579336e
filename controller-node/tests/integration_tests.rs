//! Integration tests driving the balancer frontend and the prober over
//! real HTTP servers on ephemeral ports.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use axum::http::StatusCode;
use common::{dead_addr, routable_worker, spawn_frontend, spawn_worker, MockRuntime};
use controller_node::balancer::{Balancer, SelectionPolicy, WorkerStatus};
use controller_node::config::DiscoveryConfig;
use controller_node::discovery::Prober;
use controller_node::prom::TargetsFile;

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

mod proxy_frontend {
    use super::*;

    /// With one healthy and one degraded worker under latency selection,
    /// every request lands on the healthy one.
    #[tokio::test]
    async fn test_latency_mode_avoids_degraded_worker() {
        let healthy = spawn_worker(StatusCode::OK).await;
        let degraded = spawn_worker(StatusCode::OK).await;

        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        balancer.publish(vec![
            routable_worker("healthy", healthy.addr, WorkerStatus::Healthy, 0.05),
            routable_worker(
                "degraded",
                degraded.addr,
                WorkerStatus::Degraded,
                f64::INFINITY,
            ),
        ]);
        let frontend = spawn_frontend(balancer).await;
        let client = client();

        // Switch policy through the control surface
        let response = client
            .get(format!("http://{frontend}/set_mode/latency"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        for _ in 0..10 {
            let response = client
                .get(format!("http://{frontend}/load"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(healthy.hit_count(), 10);
        assert_eq!(degraded.hit_count(), 0);
    }

    /// A worker that cannot be reached is covered by cross-worker retry:
    /// six round-robin requests all succeed, none returns 502.
    #[tokio::test]
    async fn test_round_robin_retries_across_workers() {
        let first = spawn_worker(StatusCode::OK).await;
        let broken = dead_addr().await;
        let third = spawn_worker(StatusCode::OK).await;

        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        balancer.publish(vec![
            routable_worker("first", first.addr, WorkerStatus::Healthy, 0.05),
            routable_worker("broken", broken, WorkerStatus::Healthy, 0.05),
            routable_worker("third", third.addr, WorkerStatus::Healthy, 0.05),
        ]);
        let frontend = spawn_frontend(balancer).await;
        let client = client();

        for _ in 0..6 {
            let response = client
                .get(format!("http://{frontend}/load"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.text().await.unwrap(), "ok");
        }
        assert_eq!(first.hit_count() + third.hit_count(), 6);
    }

    /// No discovered workers: the entry selection fails with 503.
    #[tokio::test]
    async fn test_empty_routable_set_returns_503() {
        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        balancer.publish(Vec::new());
        let frontend = spawn_frontend(balancer).await;

        let response = client()
            .get(format!("http://{frontend}/load"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.text().await.unwrap(), "No healthy servers");
    }

    /// Every routable worker unreachable: retry budget drains into 502.
    #[tokio::test]
    async fn test_unreachable_fleet_returns_502() {
        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        balancer.publish(vec![routable_worker(
            "gone",
            dead_addr().await,
            WorkerStatus::Healthy,
            0.05,
        )]);
        let frontend = spawn_frontend(balancer).await;

        let response = client()
            .get(format!("http://{frontend}/load"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.text().await.unwrap(),
            "All backend servers unavailable"
        );
    }

    /// Declared bodies above 5 MiB are rejected before selection.
    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let worker = spawn_worker(StatusCode::OK).await;
        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        balancer.publish(vec![routable_worker(
            "w",
            worker.addr,
            WorkerStatus::Healthy,
            0.05,
        )]);
        let frontend = spawn_frontend(balancer).await;

        let response = client()
            .post(format!("http://{frontend}/load"))
            .body(vec![0u8; 6 * 1024 * 1024])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(worker.hit_count(), 0);
    }

    /// Hop-by-hop headers are stripped in both directions; ordinary
    /// headers, the method, and the query string pass through.
    #[tokio::test]
    async fn test_forwarding_preserves_request_and_strips_hop_by_hop() {
        let worker = spawn_worker(StatusCode::OK).await;
        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        balancer.publish(vec![routable_worker(
            "w",
            worker.addr,
            WorkerStatus::Healthy,
            0.05,
        )]);
        let frontend = spawn_frontend(balancer).await;

        let response = client()
            .post(format!("http://{frontend}/load?foo=bar&n=1"))
            .header("proxy-authorization", "Bearer secret")
            .header("x-client", "integration")
            .body("payload")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        // Request direction
        assert_eq!(headers.get("x-saw-proxy-auth").unwrap(), "false");
        assert_eq!(headers.get("x-saw-client-header").unwrap(), "true");
        assert_eq!(headers.get("x-echo-method").unwrap(), "POST");
        assert_eq!(headers.get("x-echo-query").unwrap(), "foo=bar&n=1");
        // Response direction
        assert!(headers.get("proxy-authenticate").is_none());
        assert_eq!(headers.get("x-upstream").unwrap(), "yes");
    }
}

mod control_surface {
    use super::*;

    async fn frontend_with_one_worker() -> (std::net::SocketAddr, common::WorkerHandle) {
        let worker = spawn_worker(StatusCode::OK).await;
        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        balancer.publish(vec![routable_worker(
            "w1",
            worker.addr,
            WorkerStatus::Healthy,
            0.021,
        )]);
        (spawn_frontend(balancer).await, worker)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (frontend, _worker) = frontend_with_one_worker().await;
        let response = client()
            .get(format!("http://{frontend}/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_set_mode_rejects_unknown_policy() {
        let (frontend, _worker) = frontend_with_one_worker().await;
        let client = client();

        let response = client
            .get(format!("http://{frontend}/set_mode/fastest"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Invalid mode");

        let response = client
            .get(format!("http://{frontend}/set_mode/least_connections"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["previous_mode"], "round_robin");
    }

    #[tokio::test]
    async fn test_status_reports_fleet_view() {
        let (frontend, _worker) = frontend_with_one_worker().await;
        let response = client()
            .get(format!("http://{frontend}/status"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["load_balancer"]["status"], "healthy");
        assert_eq!(body["load_balancer"]["mode"], "round_robin");
        assert_eq!(body["backend_servers"]["total"], 1);
        assert_eq!(body["backend_servers"]["healthy"], 1);
        let server = &body["backend_servers"]["servers"][0];
        assert_eq!(server["status"], "healthy");
        assert_eq!(server["container_name"], "w1");
        assert!((server["latency"].as_f64().unwrap() - 0.021).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_metrics_concatenates_upstream_bodies() {
        let (frontend, _worker) = frontend_with_one_worker().await;
        let response = client()
            .get(format!("http://{frontend}/metrics"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let body = response.text().await.unwrap();
        assert!(body.contains("backend_servers_total 1"));
        assert!(body.contains("backend_servers_healthy 1"));
        assert!(body.contains("load_balancer_uptime"));
        assert!(body.contains("# Backend: "));
        assert!(body.contains("worker_requests_total 1"));
    }

    #[tokio::test]
    async fn test_cpu_toggle_forwards_once() {
        let (frontend, _worker) = frontend_with_one_worker().await;
        let response = client()
            .post(format!("http://{frontend}/cpu/toggle"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "cpu load toggled");
    }

    #[tokio::test]
    async fn test_cpu_toggle_without_workers_is_503() {
        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        let frontend = spawn_frontend(balancer).await;
        let response = client()
            .post(format!("http://{frontend}/cpu/toggle"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_index_favicon_and_fallback() {
        let (frontend, _worker) = frontend_with_one_worker().await;
        let client = client();

        let response = client
            .get(format!("http://{frontend}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["endpoints"]["load_balancing"], "/load");

        let response = client
            .get(format!("http://{frontend}/favicon.ico"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = client
            .get(format!("http://{frontend}/no/such/route"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.text().await.unwrap(), "Endpoint not found");
    }
}

mod discovery_passes {
    use super::*;

    const TEST_NETWORK: &str = "testnet";

    fn prober_for(
        runtime: Arc<MockRuntime>,
        balancer: Arc<Balancer>,
        worker_port: u16,
        targets_path: &str,
    ) -> Prober {
        let cfg = DiscoveryConfig {
            network_name: TEST_NETWORK.to_string(),
            worker_port,
            probe_timeout_seconds: 1,
            grace_seconds: 600,
            ..Default::default()
        };
        Prober::new(
            runtime,
            balancer,
            TargetsFile::new(targets_path, "backend"),
            cfg,
            "backend:latest".to_string(),
            Arc::new(Notify::new()),
        )
        .unwrap()
    }

    fn attach(runtime: &MockRuntime, name: &str) {
        runtime.push(
            name,
            false,
            HashMap::from([(TEST_NETWORK.to_string(), "127.0.0.1".parse().unwrap())]),
        );
    }

    /// A responsive worker is published as healthy with a finite latency,
    /// and its address lands in the scrape-targets file.
    #[tokio::test]
    async fn test_pass_publishes_healthy_worker() {
        let worker = spawn_worker(StatusCode::OK).await;
        let runtime = Arc::new(MockRuntime::new(1));
        attach(&runtime, "w1");

        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        let dir = tempfile::tempdir().unwrap();
        let targets_path = dir.path().join("flask.json");
        let mut prober = prober_for(
            runtime,
            balancer.clone(),
            worker.addr.port(),
            targets_path.to_str().unwrap(),
        );

        assert_eq!(prober.pass(Instant::now()).await.unwrap(), 1);

        let set = balancer.routable();
        assert_eq!(set.generation, 1);
        assert_eq!(set.workers.len(), 1);
        assert_eq!(set.workers[0].status, WorkerStatus::Healthy);
        assert!(set.workers[0].last_latency_seconds.is_finite());
        assert!(set.workers[0].last_success.is_some());

        let document: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&targets_path).unwrap()).unwrap();
        assert_eq!(
            document[0]["targets"][0],
            format!("127.0.0.1:{}", worker.addr.port())
        );
    }

    /// A probe failure inside the grace window demotes the worker to
    /// degraded; past the window it becomes unhealthy and unroutable.
    #[tokio::test]
    async fn test_grace_window_classification() {
        let worker = spawn_worker(StatusCode::OK).await;
        let runtime = Arc::new(MockRuntime::new(1));
        attach(&runtime, "w1");

        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        let dir = tempfile::tempdir().unwrap();
        let mut prober = prober_for(
            runtime,
            balancer.clone(),
            worker.addr.port(),
            dir.path().join("flask.json").to_str().unwrap(),
        );

        let t0 = Instant::now();
        prober.pass(t0).await.unwrap();
        assert_eq!(balancer.routable().workers[0].status, WorkerStatus::Healthy);

        // Worker dies; the next probe fails but the success is recent
        worker.kill();
        tokio::time::sleep(Duration::from_millis(50)).await;
        prober.pass(t0 + Duration::from_secs(30)).await.unwrap();
        let set = balancer.routable();
        assert_eq!(set.workers.len(), 1);
        assert_eq!(set.workers[0].status, WorkerStatus::Degraded);
        assert!(set.workers[0].last_latency_seconds.is_infinite());

        // Past the grace window the worker drops out of the routable set
        prober.pass(t0 + Duration::from_secs(601)).await.unwrap();
        assert!(balancer.routable().workers.is_empty());
        assert_eq!(balancer.probed()[0].status, WorkerStatus::Unhealthy);
    }

    /// A worker that never succeeded gets no grace.
    #[tokio::test]
    async fn test_never_successful_worker_is_unhealthy() {
        let worker = spawn_worker(StatusCode::INTERNAL_SERVER_ERROR).await;
        let runtime = Arc::new(MockRuntime::new(1));
        attach(&runtime, "w1");

        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        let dir = tempfile::tempdir().unwrap();
        let mut prober = prober_for(
            runtime,
            balancer.clone(),
            worker.addr.port(),
            dir.path().join("flask.json").to_str().unwrap(),
        );

        prober.pass(Instant::now()).await.unwrap();
        assert!(balancer.routable().workers.is_empty());
        assert_eq!(balancer.probed()[0].status, WorkerStatus::Unhealthy);
    }

    /// No discovered workers: an empty set is published and the targets
    /// file is emptied.
    #[tokio::test]
    async fn test_empty_discovery_publishes_empty_set() {
        let runtime = Arc::new(MockRuntime::new(1));
        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        balancer.publish(vec![routable_worker(
            "stale",
            dead_addr().await,
            WorkerStatus::Healthy,
            0.05,
        )]);

        let dir = tempfile::tempdir().unwrap();
        let targets_path = dir.path().join("flask.json");
        let mut prober = prober_for(
            runtime,
            balancer.clone(),
            5000,
            targets_path.to_str().unwrap(),
        );

        assert_eq!(prober.pass(Instant::now()).await.unwrap(), 0);
        assert!(balancer.routable().workers.is_empty());
        assert_eq!(balancer.routable().generation, 2);

        let document: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&targets_path).unwrap()).unwrap();
        assert_eq!(document, serde_json::json!([]));
    }

    /// A container without an address on the overlay network is skipped.
    #[tokio::test]
    async fn test_detached_container_is_skipped() {
        let worker = spawn_worker(StatusCode::OK).await;
        let runtime = Arc::new(MockRuntime::new(1));
        attach(&runtime, "attached");
        runtime.push("detached", false, HashMap::new());

        let balancer = Arc::new(Balancer::new(SelectionPolicy::RoundRobin));
        let dir = tempfile::tempdir().unwrap();
        let mut prober = prober_for(
            runtime,
            balancer.clone(),
            worker.addr.port(),
            dir.path().join("flask.json").to_str().unwrap(),
        );

        assert_eq!(prober.pass(Instant::now()).await.unwrap(), 1);
        assert_eq!(balancer.probed().len(), 1);
        assert_eq!(balancer.probed()[0].container_name, "attached");
    }
}
