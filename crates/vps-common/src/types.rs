use crate::{Result, VpsError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

pub const CPU_CORES_RANGE: RangeInclusive<f64> = 0.5..=4.0;
pub const MEMORY_MB_RANGE: RangeInclusive<u32> = 512..=8192;
pub const STORAGE_GB_RANGE: RangeInclusive<u32> = 10..=100;

/// CFS scheduling period in microseconds. CPU quota is expressed against it.
pub const CPU_PERIOD_US: i64 = 100_000;

pub fn new_instance_id() -> String {
    format!("vps-{}", uuid::Uuid::new_v4().simple())
}

// Resource sizing of an instance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_cores: f64,
    pub memory_mb: u32,
    pub storage_gb: u32,
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if !self.cpu_cores.is_finite() || !CPU_CORES_RANGE.contains(&self.cpu_cores) {
            return Err(VpsError::InvalidConfig(format!(
                "CPU cores must be between {} and {}, got {}",
                CPU_CORES_RANGE.start(),
                CPU_CORES_RANGE.end(),
                self.cpu_cores
            )));
        }
        if !MEMORY_MB_RANGE.contains(&self.memory_mb) {
            return Err(VpsError::InvalidConfig(format!(
                "Memory must be between {}MB and {}MB, got {}MB",
                MEMORY_MB_RANGE.start(),
                MEMORY_MB_RANGE.end(),
                self.memory_mb
            )));
        }
        if !STORAGE_GB_RANGE.contains(&self.storage_gb) {
            return Err(VpsError::InvalidConfig(format!(
                "Storage must be between {}GB and {}GB, got {}GB",
                STORAGE_GB_RANGE.start(),
                STORAGE_GB_RANGE.end(),
                self.storage_gb
            )));
        }
        Ok(())
    }

    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_cores * CPU_PERIOD_US as f64).round() as i64
    }

    pub fn memory_bytes(&self) -> i64 {
        i64::from(self.memory_mb) * 1024 * 1024
    }

    pub fn memory_gb(&self) -> f64 {
        f64::from(self.memory_mb) / 1024.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub cpu_cores: f64,
    pub memory_mb: u32,
    pub storage_gb: u32,
    pub image: String,
    /// Container port (e.g. `"22/tcp"`) to host port.
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl InstanceConfig {
    pub fn new(cpu_cores: f64, memory_mb: u32, storage_gb: u32, image: impl Into<String>) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            storage_gb,
            image: image.into(),
            ports: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_cores: self.cpu_cores,
            memory_mb: self.memory_mb,
            storage_gb: self.storage_gb,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.cpu_cores = limits.cpu_cores;
        self.memory_mb = limits.memory_mb;
        self.storage_gb = limits.storage_gb;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.limits().validate()?;
        if self.image.trim().is_empty() {
            return Err(VpsError::InvalidConfig("Image reference must not be empty".into()));
        }
        for (container_port, host_port) in &self.ports {
            let port = container_port.split('/').next().unwrap_or_default();
            if port.parse::<u16>().is_err() || host_port.parse::<u16>().is_err() {
                return Err(VpsError::InvalidConfig(format!(
                    "Invalid port mapping {container_port} -> {host_port}"
                )));
            }
        }
        Ok(())
    }

    /// Environment in the `KEY=value` form container runtimes expect.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Suspended,
    Deleted,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    /// Image reference (`repo:tag`) produced by the snapshot.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Stable logical identifier handed to users.
    pub id: String,
    /// Current runtime handle. Changes on restore.
    pub container_id: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub config: InstanceConfig,
    pub status: InstanceStatus,
    pub last_billed_at: DateTime<Utc>,
    #[serde(default)]
    pub payment_overdue: bool,
    #[serde(default)]
    pub grace_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub suspended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backups: Vec<BackupDescriptor>,
}

impl InstanceRecord {
    pub fn new(
        id: String,
        container_id: String,
        owner: String,
        config: InstanceConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            container_id,
            owner,
            created_at: now,
            config,
            status: InstanceStatus::Running,
            last_billed_at: now,
            payment_overdue: false,
            grace_period_end: None,
            suspended_at: None,
            backups: Vec::new(),
        }
    }

    pub fn next_billing_at(&self, interval: Duration) -> DateTime<Utc> {
        self.last_billed_at + interval
    }

    pub fn is_billing_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        now >= self.next_billing_at(interval)
    }

    pub fn mark_overdue(&mut self, now: DateTime<Utc>, grace: Duration) {
        self.payment_overdue = true;
        self.grace_period_end = Some(now + grace);
    }

    pub fn mark_paid(&mut self, now: DateTime<Utc>) {
        self.last_billed_at = now;
        self.payment_overdue = false;
        self.grace_period_end = None;
    }

    pub fn grace_expired(&self, now: DateTime<Utc>) -> bool {
        self.payment_overdue && self.grace_period_end.is_some_and(|end| now > end)
    }

    pub fn is_suspended(&self) -> bool {
        self.status == InstanceStatus::Suspended
    }

    /// Twelve-character prefix of the container handle, for messages.
    pub fn short_container_id(&self) -> &str {
        let end = self.container_id.len().min(12);
        &self.container_id[..end]
    }
}

/// One point-in-time measurement of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    pub instance_id: String,
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub disk_percent: f64,
}

impl StatsSample {
    pub fn network_peak_bytes(&self) -> u64 {
        self.network_rx_bytes.max(self.network_tx_bytes)
    }
}

/// Running maximum of key metrics for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakRecord {
    pub instance_id: String,
    pub peak_cpu: f64,
    pub peak_memory: f64,
    pub peak_network: u64,
    pub last_updated: DateTime<Utc>,
}

impl PeakRecord {
    pub fn from_sample(sample: &StatsSample) -> Self {
        Self {
            instance_id: sample.instance_id.clone(),
            peak_cpu: sample.cpu_percent,
            peak_memory: sample.memory_percent,
            peak_network: sample.network_peak_bytes(),
            last_updated: sample.timestamp,
        }
    }

    /// Greatest-of merge. Every field is non-decreasing.
    pub fn merge(&mut self, sample: &StatsSample) {
        self.peak_cpu = self.peak_cpu.max(sample.cpu_percent);
        self.peak_memory = self.peak_memory.max(sample.memory_percent);
        self.peak_network = self.peak_network.max(sample.network_peak_bytes());
        self.last_updated = self.last_updated.max(sample.timestamp);
    }
}
