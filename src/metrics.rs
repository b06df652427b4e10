//! Monitoring proxy.
//!
//! Read-only range queries against the monitoring system, keyed by provider
//! instance id. Lifecycle state is irrelevant here with one exception:
//! DELETED VMs are never queried.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::MonitoringConfig;
use crate::errors::Error;
use crate::store::VmStore;
use crate::types::{InstanceId, VmId, VmStatus};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Lifecycle(#[from] Error),

    #[error("monitoring query failed: {0}")]
    Query(String),

    #[error("monitoring unreachable: {0}")]
    Unreachable(String),
}

/// One labelled series of (unix seconds, value) points.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    pub label: String,
    pub points: Vec<(i64, f64)>,
}

pub struct MetricsProxy {
    http: reqwest::Client,
    config: MonitoringConfig,
    store: Arc<VmStore>,
    clock: Arc<dyn Clock>,
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: QueryData,
}

#[derive(Deserialize, Default)]
struct QueryData {
    #[serde(default)]
    result: Vec<SeriesBody>,
}

#[derive(Deserialize)]
struct SeriesBody {
    #[serde(default)]
    metric: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Query resolution step, linear in the queried range: 5 minutes for an
/// hour of data, stretching to roughly 161 minutes at four weeks. Keeps
/// point counts in the same ballpark regardless of zoom level.
pub fn step_for(range_secs: u64) -> u64 {
    const MIN_TIME: f64 = 3600.0;
    const MAX_TIME: f64 = 28.0 * 24.0 * 3600.0;
    const MIN_STEP: f64 = 300.0;
    const MAX_STEP: f64 = 9676.0;

    let range = range_secs as f64;
    if range <= MIN_TIME {
        return MIN_STEP as u64;
    }
    let ratio = (range - MIN_TIME) / (MAX_TIME - MIN_TIME);
    (MIN_STEP + ratio * (MAX_STEP - MIN_STEP)).round() as u64
}

impl MetricsProxy {
    pub fn new(
        config: MonitoringConfig,
        store: Arc<VmStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MonitorError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| MonitorError::Unreachable(format!("cannot build http client: {e}")))?;
        Ok(Self {
            http,
            config,
            store,
            clock,
        })
    }

    /// Resolve the queryable instance for a VM. DELETED VMs are refused,
    /// never queried.
    async fn instance_for(&self, vm_id: VmId) -> Result<InstanceId, MonitorError> {
        let record = self
            .store
            .get(vm_id)
            .await
            .ok_or(Error::NotFound(vm_id))?;
        if record.status == VmStatus::Deleted {
            return Err(Error::InvalidState {
                vm_id,
                current: record.status,
                requested: "metrics-query".to_string(),
            }
            .into());
        }
        record.instance_id.ok_or_else(|| {
            Error::Validation(format!("vm {vm_id} has no provider instance")).into()
        })
    }

    pub async fn cpu_usage(&self, vm_id: VmId, range_secs: u64) -> Result<Vec<MetricSeries>, MonitorError> {
        let instance = self.instance_for(vm_id).await?;
        let query = format!(
            "100 - (avg by (instance) (rate(node_cpu_seconds_total{{mode=\"idle\", \
             instance_id=\"{instance}\", environment=\"{env}\", job=\"{job}\"}}[5m]))) * 100",
            env = self.config.environment,
            job = self.config.job_name,
        );
        self.query_range(&query, range_secs, "cpu").await
    }

    pub async fn memory_usage(&self, vm_id: VmId, range_secs: u64) -> Result<Vec<MetricSeries>, MonitorError> {
        let instance = self.instance_for(vm_id).await?;
        let selector = format!(
            "instance_id=\"{instance}\", environment=\"{env}\", job=\"{job}\"",
            env = self.config.environment,
            job = self.config.job_name,
        );
        let query = format!(
            "(1 - (node_memory_MemAvailable_bytes{{{selector}}} / \
             node_memory_MemTotal_bytes{{{selector}}})) * 100"
        );
        self.query_range(&query, range_secs, "memory").await
    }

    pub async fn disk_usage(&self, vm_id: VmId, range_secs: u64) -> Result<Vec<MetricSeries>, MonitorError> {
        let instance = self.instance_for(vm_id).await?;
        let mut all = Vec::new();
        for mountpoint in &self.config.mountpoints {
            let selector = format!(
                "instance_id=\"{instance}\", environment=\"{env}\", job=\"{job}\", \
                 mountpoint=\"{mountpoint}\"",
                env = self.config.environment,
                job = self.config.job_name,
            );
            let query = format!(
                "100 - ((node_filesystem_avail_bytes{{{selector}}} / \
                 node_filesystem_size_bytes{{{selector}}}) * 100)"
            );
            let mut series = self.query_range(&query, range_secs, mountpoint).await?;
            all.append(&mut series);
        }
        Ok(all)
    }

    async fn query_range(
        &self,
        query: &str,
        range_secs: u64,
        label: &str,
    ) -> Result<Vec<MetricSeries>, MonitorError> {
        let end = self.clock.now();
        let start = end - chrono::Duration::seconds(range_secs as i64);
        let step = step_for(range_secs);

        let url = format!("{}/api/v1/query_range", self.config.url.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .query(&[
                ("query", query.to_string()),
                ("start", timestamp_param(start)),
                ("end", timestamp_param(end)),
                ("step", step.to_string()),
            ])
            .send()
            .await
            .map_err(|e| MonitorError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MonitorError::Query(format!("HTTP {}", response.status())));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| MonitorError::Query(format!("malformed response: {e}")))?;
        if body.status != "success" {
            return Err(MonitorError::Query(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(body
            .data
            .result
            .into_iter()
            .map(|series| MetricSeries {
                label: series
                    .metric
                    .get("instance")
                    .and_then(|v| v.as_str())
                    .map(|instance| format!("{label}:{instance}"))
                    .unwrap_or_else(|| label.to_string()),
                points: series
                    .values
                    .into_iter()
                    .filter_map(|(ts, value)| value.parse::<f64>().ok().map(|v| (ts as i64, v)))
                    .collect(),
            })
            .collect())
    }
}

fn timestamp_param(t: DateTime<Utc>) -> String {
    t.timestamp().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_is_five_minutes_up_to_an_hour() {
        assert_eq!(step_for(60), 300);
        assert_eq!(step_for(3600), 300);
    }

    #[test]
    fn step_scales_linearly_to_four_weeks() {
        assert_eq!(step_for(28 * 24 * 3600), 9676);
        // Halfway through the range sits halfway between the step bounds.
        let mid = 3600 + (28 * 24 * 3600 - 3600) / 2;
        let step = step_for(mid);
        assert!((4980..=4996).contains(&step), "got {step}");
    }

    #[test]
    fn step_keeps_growing_monotonically() {
        let mut last = 0;
        for range in [600, 3600, 7200, 86400, 7 * 86400, 28 * 86400] {
            let step = step_for(range);
            assert!(step >= last);
            last = step;
        }
    }
}
