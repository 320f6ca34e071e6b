//! Host configuration.
//!
//! Loaded from an optional YAML file, then overridden by `VPS_*` environment
//! variables. Every section has defaults so an empty file is valid.

use crate::pricing::PriceModel;
use crate::quota::QuotaPolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vps_common::{Result, VpsError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpsConfig {
    pub data_dir: PathBuf,
    pub runtime: RuntimeConfig,
    pub sampler: SamplerConfig,
    pub alerts: AlertConfig,
    pub billing: BillingConfig,
    pub quotas: QuotaPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on any single container runtime call.
    pub call_timeout_secs: u64,
    /// Upper bound on a create, including pulling a missing image.
    pub create_timeout_secs: u64,
    /// Grace period given to a container on stop before it is killed.
    pub stop_timeout_secs: i64,
    pub default_image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_secs: u64,
    /// Instances sampled in parallel within one cycle.
    pub concurrency: usize,
    pub retention_days: u32,
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
    /// Minimum gap between two alert notifications for one instance.
    /// Unset means every breaching cycle notifies.
    pub cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub scan_interval_secs: u64,
    pub billing_interval_days: u32,
    pub grace_period_days: u32,
    pub prices: PriceModel,
}

impl Default for VpsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            runtime: RuntimeConfig::default(),
            sampler: SamplerConfig::default(),
            alerts: AlertConfig::default(),
            billing: BillingConfig::default(),
            quotas: QuotaPolicy::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            create_timeout_secs: 300,
            stop_timeout_secs: 10,
            default_image: "ubuntu:latest".to_string(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            concurrency: 8,
            retention_days: 30,
            prune_interval_secs: 86_400,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 90.0,
            memory_threshold: 90.0,
            disk_threshold: 90.0,
            cooldown_secs: None,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 3600,
            billing_interval_days: 30,
            grace_period_days: 3,
            prices: PriceModel::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Option<chrono::Duration> {
        self.cooldown_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}

impl BillingConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn billing_interval(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.billing_interval_days))
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.grace_period_days))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn threshold_ok(value: f64) -> bool {
    value.is_finite() && (0.0..=100.0).contains(&value)
}

impl VpsConfig {
    /// Read `path` (or `VPS_CONFIG` when `path` is `None`), then apply
    /// environment overrides. A missing file means defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("VPS_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            _ => Self::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("VPS_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse("VPS_DOCKER_TIMEOUT_SECS") {
            self.runtime.call_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("VPS_SAMPLE_INTERVAL_SECS") {
            self.sampler.interval_secs = secs;
        }
        if let Some(secs) = env_parse("VPS_BILLING_SCAN_SECS") {
            self.billing.scan_interval_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(VpsError::InvalidConfig(msg.to_string()));

        if self.runtime.call_timeout_secs == 0 || self.runtime.create_timeout_secs == 0 {
            return invalid("runtime timeouts must be positive");
        }
        if self.runtime.stop_timeout_secs < 0 {
            return invalid("runtime.stop_timeout_secs must not be negative");
        }
        if self.runtime.default_image.trim().is_empty() {
            return invalid("runtime.default_image must not be empty");
        }
        if self.sampler.interval_secs == 0 || self.sampler.prune_interval_secs == 0 {
            return invalid("sampler intervals must be positive");
        }
        if self.sampler.concurrency == 0 {
            return invalid("sampler.concurrency must be positive");
        }
        if self.sampler.retention_days == 0 {
            return invalid("sampler.retention_days must be positive");
        }
        if ![
            self.alerts.cpu_threshold,
            self.alerts.memory_threshold,
            self.alerts.disk_threshold,
        ]
        .into_iter()
        .all(threshold_ok)
        {
            return invalid("alert thresholds must be between 0 and 100");
        }
        if self.billing.scan_interval_secs == 0 || self.billing.billing_interval_days == 0 {
            return invalid("billing intervals must be positive");
        }
        // The grace end must fall strictly after the failed attempt
        if self.billing.grace_period_days == 0 {
            return invalid("billing.grace_period_days must be positive");
        }
        let prices = &self.billing.prices;
        if ![
            prices.cpu_per_core,
            prices.memory_per_gb,
            prices.storage_per_gb,
            prices.bandwidth_per_gb,
        ]
        .into_iter()
        .all(|p| p.is_finite() && p >= 0.0)
        {
            return invalid("prices must be non-negative");
        }
        if self.quotas.max_instances_per_user == 0 {
            return invalid("quotas.max_instances_per_user must be positive");
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.json")
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.data_dir.join("stats")
    }
}
