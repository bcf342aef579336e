//! Metrics backend adapter and the Prometheus scrape-targets file.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ControllerError, Result};

/// The one expression the autoscaler issues: fleet-wide short-window
/// CPU-seconds per second.
pub fn cpu_rate_query(label_value: &str) -> String {
    format!(
        "sum(rate(container_cpu_usage_seconds_total{{container_label_autoscale_service=\"{label_value}\"}}[1m]))"
    )
}

/// Capability interface over the metrics backend
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Execute one instantaneous query and reduce it to a scalar.
    /// Absence of data is `0.0`; transport or payload failures are
    /// [`ControllerError::MetricFetchFailed`].
    async fn query_scalar(&self, expr: &str) -> Result<f64>;
}

/// [`MetricsSource`] backed by the Prometheus HTTP API
pub struct PromClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: serde_json::Value,
}

impl PromClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControllerError::MetricFetchFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

/// Reduce a query API payload to a single scalar
fn scalar_from_response(body: QueryResponse) -> Result<f64> {
    if body.status != "success" {
        return Err(ControllerError::MetricFetchFailed(format!(
            "query status {}",
            body.status
        )));
    }
    let Some(data) = body.data else {
        return Err(ControllerError::MetricFetchFailed(
            "response without data".to_string(),
        ));
    };

    let parse_value = |value: &serde_json::Value| -> Result<f64> {
        value
            .get(1)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| {
                ControllerError::MetricFetchFailed("malformed sample value".to_string())
            })
    };

    match data.result_type.as_str() {
        "vector" => {
            let samples = data.result.as_array().ok_or_else(|| {
                ControllerError::MetricFetchFailed("vector result is not an array".to_string())
            })?;
            match samples.first() {
                // No series matched: treat as zero load, not as a failure
                None => Ok(0.0),
                Some(sample) => parse_value(sample.get("value").ok_or_else(|| {
                    ControllerError::MetricFetchFailed("sample without value".to_string())
                })?),
            }
        }
        "scalar" => parse_value(&data.result),
        other => Err(ControllerError::MetricFetchFailed(format!(
            "unexpected result type {other}"
        ))),
    }
}

#[async_trait]
impl MetricsSource for PromClient {
    async fn query_scalar(&self, expr: &str) -> Result<f64> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("query", expr)])
            .send()
            .await
            .map_err(|e| ControllerError::MetricFetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ControllerError::MetricFetchFailed(format!(
                "query returned HTTP {}",
                response.status()
            )));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| ControllerError::MetricFetchFailed(e.to_string()))?;
        let value = scalar_from_response(body)?;
        debug!(expr = %expr, value, "scalar query completed");
        Ok(value)
    }
}

/// Prometheus `file_sd` document listing worker scrape targets.
///
/// Rewritten by every discovery pass; reset to `[]` at bootstrap and on
/// graceful shutdown so a dead controller leaves no stale targets behind.
#[derive(Debug, Clone)]
pub struct TargetsFile {
    path: PathBuf,
    job: String,
}

impl TargetsFile {
    pub fn new(path: &str, job: &str) -> Self {
        Self {
            path: PathBuf::from(path),
            job: job.to_string(),
        }
    }

    /// Replace the document with the given `host:port` targets
    pub fn write(&self, targets: &[String]) -> Result<()> {
        let document = if targets.is_empty() {
            json!([])
        } else {
            json!([{ "targets": targets, "labels": { "job": self.job } }])
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&document)?)?;
        debug!(path = %self.path.display(), targets = targets.len(), "scrape targets written");
        Ok(())
    }

    /// Reset the document to an empty target list
    pub fn clear(&self) -> Result<()> {
        self.write(&[])?;
        info!(path = %self.path.display(), "scrape targets cleared");
        Ok(())
    }
}
