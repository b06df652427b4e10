//! Centralized application configuration.
//!
//! Single source of truth for every tunable, loaded from environment
//! variables with sensible defaults and validation. Retry, threshold and
//! polling parameters live here, never as hardcoded constants.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default values for configuration
mod defaults {
    use std::path::PathBuf;

    pub fn data_dir() -> PathBuf {
        "./data/sandboxd".into()
    }

    // Idle-suspension policy (seconds)
    pub fn idle_threshold_secs() -> u64 {
        7 * 24 * 3600
    }
    pub fn retention_threshold_secs() -> u64 {
        30 * 24 * 3600
    }
    pub fn warning_threshold_secs() -> u64 {
        25 * 24 * 3600
    }
    pub fn notification_window_secs() -> u64 {
        24 * 3600
    }

    // Controller timing (seconds)
    pub fn poll_interval_secs() -> u64 {
        5
    }
    pub fn operation_timeout_secs() -> u64 {
        900
    }
    pub fn sweep_interval_secs() -> u64 {
        300
    }
    pub fn reconcile_grace_secs() -> u64 {
        120
    }
    pub fn retry_limit() -> u32 {
        3
    }
    pub fn retry_backoff_secs() -> u64 {
        2
    }

    // Provider defaults
    pub fn provider_timeout_secs() -> u64 {
        30
    }

    // Remote-access broker defaults
    pub fn broker_rdp_port() -> u16 {
        3389
    }

    // Monitoring defaults
    pub fn monitoring_job_name() -> String {
        "node".to_string()
    }
    pub fn monitoring_environment() -> String {
        "production".to_string()
    }
    pub fn monitoring_mountpoints() -> Vec<String> {
        vec!["/".to_string(), "/home".to_string()]
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("missing required configuration: {key}")]
    Missing { key: String },
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: format!("must be a non-negative integer: {e}"),
        }),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    env_u64(key, default as u64).map(|v| v as u32)
}

fn env_string(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key).unwrap_or_else(|_| default())
}

fn env_required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing {
        key: key.to_string(),
    })
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the SQLite state database.
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,
}

impl StoreConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            data_dir: std::env::var("SANDBOXD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| defaults::data_dir()),
        })
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: defaults::data_dir(),
        }
    }
}

/// Lifecycle controller and sweep timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// ACTIVE VMs idle longer than this get shelved by the policy sweep.
    #[serde(default = "defaults::idle_threshold_secs")]
    pub idle_threshold_secs: u64,
    /// SHELVED VMs older than this get deleted by the policy sweep.
    #[serde(default = "defaults::retention_threshold_secs")]
    pub retention_threshold_secs: u64,
    /// SHELVED VMs older than this (and inside the notification window)
    /// get a retention warning.
    #[serde(default = "defaults::warning_threshold_secs")]
    pub warning_threshold_secs: u64,
    /// Width of the warning window past the warning threshold.
    #[serde(default = "defaults::notification_window_secs")]
    pub notification_window_secs: u64,
    /// Delay between completion polls while an operation settles.
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Bounded wait for an operation to settle before deferring to the
    /// reconciliation sweep.
    #[serde(default = "defaults::operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Cadence of the policy and reconciliation sweeps.
    #[serde(default = "defaults::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Transient records younger than this are left alone by the
    /// reconciliation sweep.
    #[serde(default = "defaults::reconcile_grace_secs")]
    pub reconcile_grace_secs: u64,
    /// Attempts per sweep when the provider is unreachable.
    #[serde(default = "defaults::retry_limit")]
    pub retry_limit: u32,
    /// Base backoff between unreachable-provider retries; doubles per attempt.
    #[serde(default = "defaults::retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl LifecycleConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self {
            idle_threshold_secs: env_u64("IDLE_THRESHOLD_SECS", defaults::idle_threshold_secs())?,
            retention_threshold_secs: env_u64(
                "RETENTION_THRESHOLD_SECS",
                defaults::retention_threshold_secs(),
            )?,
            warning_threshold_secs: env_u64(
                "WARNING_THRESHOLD_SECS",
                defaults::warning_threshold_secs(),
            )?,
            notification_window_secs: env_u64(
                "NOTIFICATION_WINDOW_SECS",
                defaults::notification_window_secs(),
            )?,
            poll_interval_secs: env_u64("POLL_INTERVAL_SECS", defaults::poll_interval_secs())?,
            operation_timeout_secs: env_u64(
                "OPERATION_TIMEOUT_SECS",
                defaults::operation_timeout_secs(),
            )?,
            sweep_interval_secs: env_u64("SWEEP_INTERVAL_SECS", defaults::sweep_interval_secs())?,
            reconcile_grace_secs: env_u64(
                "RECONCILE_GRACE_SECS",
                defaults::reconcile_grace_secs(),
            )?,
            retry_limit: env_u32("RETRY_LIMIT", defaults::retry_limit())?,
            retry_backoff_secs: env_u64("RETRY_BACKOFF_SECS", defaults::retry_backoff_secs())?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_threshold_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "IDLE_THRESHOLD_SECS".to_string(),
                value: "0".to_string(),
                reason: "idle threshold must be positive".to_string(),
            });
        }
        if self.warning_threshold_secs >= self.retention_threshold_secs {
            return Err(ConfigError::InvalidValue {
                key: "WARNING_THRESHOLD_SECS".to_string(),
                value: self.warning_threshold_secs.to_string(),
                reason: "warning threshold must precede the retention threshold".to_string(),
            });
        }
        Ok(())
    }

    /// Aggressive timings for tests: no settle wait past the first poll,
    /// no grace period before reconciliation.
    pub fn testing() -> Self {
        Self {
            idle_threshold_secs: 600,
            retention_threshold_secs: 3600,
            warning_threshold_secs: 1800,
            notification_window_secs: 900,
            poll_interval_secs: 0,
            operation_timeout_secs: 0,
            sweep_interval_secs: 1,
            reconcile_grace_secs: 0,
            retry_limit: 2,
            retry_backoff_secs: 0,
        }
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_secs as i64)
    }

    pub fn retention_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_threshold_secs as i64)
    }

    pub fn warning_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.warning_threshold_secs as i64)
    }

    pub fn notification_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.notification_window_secs as i64)
    }

    pub fn reconcile_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconcile_grace_secs as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: defaults::idle_threshold_secs(),
            retention_threshold_secs: defaults::retention_threshold_secs(),
            warning_threshold_secs: defaults::warning_threshold_secs(),
            notification_window_secs: defaults::notification_window_secs(),
            poll_interval_secs: defaults::poll_interval_secs(),
            operation_timeout_secs: defaults::operation_timeout_secs(),
            sweep_interval_secs: defaults::sweep_interval_secs(),
            reconcile_grace_secs: defaults::reconcile_grace_secs(),
            retry_limit: defaults::retry_limit(),
            retry_backoff_secs: defaults::retry_backoff_secs(),
        }
    }
}

/// Cloud provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the compute API.
    pub compute_url: String,
    /// Pre-issued authentication token.
    pub auth_token: String,
    /// Per-request timeout for adapter calls.
    #[serde(default = "defaults::provider_timeout_secs")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            compute_url: env_required("PROVIDER_COMPUTE_URL")?,
            auth_token: env_required("PROVIDER_AUTH_TOKEN")?,
            timeout_secs: env_u64("PROVIDER_TIMEOUT_SECS", defaults::provider_timeout_secs())?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Remote-access broker endpoint. Optional; without it no remote-desktop
/// connections are managed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "defaults::broker_rdp_port")]
    pub rdp_port: u16,
}

impl BrokerConfig {
    /// Returns None when no broker is configured.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let base_url = match std::env::var("BROKER_BASE_URL") {
            Ok(url) => url,
            Err(_) => return Ok(None),
        };
        Ok(Some(Self {
            base_url,
            username: env_required("BROKER_USERNAME")?,
            password: env_required("BROKER_PASSWORD")?,
            rdp_port: env_u64("BROKER_RDP_PORT", defaults::broker_rdp_port() as u64)? as u16,
        }))
    }
}

/// Monitoring proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub url: String,
    #[serde(default = "defaults::monitoring_job_name")]
    pub job_name: String,
    #[serde(default = "defaults::monitoring_environment")]
    pub environment: String,
    #[serde(default = "defaults::monitoring_mountpoints")]
    pub mountpoints: Vec<String>,
}

impl MonitoringConfig {
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let url = match std::env::var("MONITORING_URL") {
            Ok(url) => url,
            Err(_) => return Ok(None),
        };
        let mountpoints = env_string("MONITORING_MOUNTPOINTS", || {
            defaults::monitoring_mountpoints().join(",")
        })
        .split(',')
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
        Ok(Some(Self {
            url,
            job_name: env_string("MONITORING_JOB_NAME", defaults::monitoring_job_name),
            environment: env_string("MONITORING_ENVIRONMENT", defaults::monitoring_environment),
            mountpoints,
        }))
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub lifecycle: LifecycleConfig,
    pub provider: ProviderConfig,
    pub broker: Option<BrokerConfig>,
    pub monitoring: Option<MonitoringConfig>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            store: StoreConfig::load()?,
            lifecycle: LifecycleConfig::load()?,
            provider: ProviderConfig::load()?,
            broker: BrokerConfig::load()?,
            monitoring: MonitoringConfig::load()?,
        })
    }
}
