//! Threshold alerts over fresh samples.

use crate::config::AlertConfig;
use crate::notify::{Notification, Notifier};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};
use vps_common::{Result, StatsSample, VpsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: 90.0,
            memory: 90.0,
            disk: 90.0,
        }
    }
}

impl From<&AlertConfig> for Thresholds {
    fn from(config: &AlertConfig) -> Self {
        Self {
            cpu: config.cpu_threshold,
            memory: config.memory_threshold,
            disk: config.disk_threshold,
        }
    }
}

impl Thresholds {
    /// One line per resource strictly above its threshold.
    pub fn breaches(&self, sample: &StatsSample) -> Vec<String> {
        let mut lines = Vec::new();
        if sample.cpu_percent > self.cpu {
            lines.push(format!("High CPU Usage: {:.1}%", sample.cpu_percent));
        }
        if sample.memory_percent > self.memory {
            lines.push(format!("High Memory Usage: {:.1}%", sample.memory_percent));
        }
        if sample.disk_percent > self.disk {
            lines.push(format!("High Disk Usage: {:.1}%", sample.disk_percent));
        }
        lines
    }
}

pub struct AlertEvaluator {
    registry: Arc<Registry>,
    notifier: Arc<dyn Notifier>,
    thresholds: RwLock<Thresholds>,
    cooldown: Option<chrono::Duration>,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertEvaluator {
    pub fn new(registry: Arc<Registry>, notifier: Arc<dyn Notifier>, thresholds: Thresholds) -> Self {
        Self {
            registry,
            notifier,
            thresholds: RwLock::new(thresholds),
            cooldown: None,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Option<chrono::Duration>) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn thresholds(&self) -> Thresholds {
        *self
            .thresholds
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_threshold(&self, resource: Resource, value: f64) -> Result<()> {
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(VpsError::InvalidConfig(format!(
                "Threshold must be between 0 and 100, got {value}"
            )));
        }
        let mut thresholds = self
            .thresholds
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match resource {
            Resource::Cpu => thresholds.cpu = value,
            Resource::Memory => thresholds.memory = value,
            Resource::Disk => thresholds.disk = value,
        }
        Ok(())
    }

    /// Current alert lines for a sample, including a stopped container.
    pub fn active_alerts(&self, sample: &StatsSample) -> Vec<String> {
        let mut lines = self.thresholds().breaches(sample);
        if sample.status != "running" {
            lines.push(format!("Container not running (status: {})", sample.status));
        }
        lines
    }

    fn cooling_down(&self, instance_id: &str, now: DateTime<Utc>) -> bool {
        let Some(cooldown) = self.cooldown else {
            return false;
        };
        let last_sent = self
            .last_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last_sent
            .get(instance_id)
            .is_some_and(|sent| now - *sent < cooldown)
    }

    fn mark_sent(&self, instance_id: &str, now: DateTime<Utc>) {
        if self.cooldown.is_some() {
            self.last_sent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(instance_id.to_string(), now);
        }
    }

    /// Notify owners of every breaching instance in `samples`, one bundled
    /// notification per instance. Returns how many notifications went out.
    pub async fn dispatch(&self, samples: &[StatsSample], now: DateTime<Utc>) -> usize {
        let thresholds = self.thresholds();
        let mut sent = 0;

        for sample in samples {
            let lines = thresholds.breaches(sample);
            if lines.is_empty() || self.cooling_down(&sample.instance_id, now) {
                continue;
            }

            let owner = match self.registry.get(&sample.instance_id).await {
                Ok(record) => record.owner,
                Err(_) => {
                    debug!(instance_id = %sample.instance_id, "Instance gone, dropping alert");
                    continue;
                }
            };

            let notification = Notification::ResourceAlert {
                instance_id: sample.instance_id.clone(),
                alerts: lines,
            };
            match self.notifier.notify(&owner, notification).await {
                Ok(()) => {
                    self.mark_sent(&sample.instance_id, now);
                    sent += 1;
                }
                Err(e) => {
                    warn!(instance_id = %sample.instance_id, %owner, error = %e, "Alert delivery failed")
                }
            }
        }
        sent
    }
}
