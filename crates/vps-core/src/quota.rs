use serde::{Deserialize, Serialize};
use vps_common::{InstanceRecord, ResourceLimits, Result, VpsError};

/// Per-user ceilings, checked before any container is created or resized.
/// Suspended instances still count against them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    pub max_instances_per_user: usize,
    pub max_cpu_cores_per_user: f64,
    pub max_memory_mb_per_user: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            max_instances_per_user: 3,
            max_cpu_cores_per_user: 8.0,
            max_memory_mb_per_user: 16384,
        }
    }
}

impl QuotaPolicy {
    /// `replacing` names an existing instance whose limits are being changed;
    /// it is left out of the totals and the instance count.
    pub fn check(
        &self,
        existing: &[InstanceRecord],
        replacing: Option<&str>,
        requested: &ResourceLimits,
    ) -> Result<()> {
        let others: Vec<&InstanceRecord> = existing
            .iter()
            .filter(|r| Some(r.id.as_str()) != replacing)
            .collect();

        if replacing.is_none() && others.len() >= self.max_instances_per_user {
            return Err(VpsError::QuotaExceeded(format!(
                "instance limit reached ({} of {})",
                others.len(),
                self.max_instances_per_user
            )));
        }

        let current_cpu: f64 = others.iter().map(|r| r.config.cpu_cores).sum();
        if current_cpu + requested.cpu_cores > self.max_cpu_cores_per_user {
            return Err(VpsError::QuotaExceeded(format!(
                "CPU limit exceeded: {} + {} > {} cores",
                current_cpu, requested.cpu_cores, self.max_cpu_cores_per_user
            )));
        }

        let current_memory: u64 = others.iter().map(|r| u64::from(r.config.memory_mb)).sum();
        if current_memory + u64::from(requested.memory_mb)
            > u64::from(self.max_memory_mb_per_user)
        {
            return Err(VpsError::QuotaExceeded(format!(
                "memory limit exceeded: {}MB + {}MB > {}MB",
                current_memory, requested.memory_mb, self.max_memory_mb_per_user
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vps_common::InstanceConfig;

    fn owned(id: &str, cpu: f64, mem: u32) -> InstanceRecord {
        InstanceRecord::new(
            id.into(),
            format!("c-{id}"),
            "alice".into(),
            InstanceConfig::new(cpu, mem, 20, "ubuntu:latest"),
            Utc::now(),
        )
    }

    fn limits(cpu: f64, mem: u32) -> ResourceLimits {
        ResourceLimits {
            cpu_cores: cpu,
            memory_mb: mem,
            storage_gb: 20,
        }
    }

    #[test]
    fn test_instance_count_limit() {
        let policy = QuotaPolicy::default();
        let existing = vec![owned("a", 1.0, 1024), owned("b", 1.0, 1024)];
        assert!(policy.check(&existing, None, &limits(1.0, 1024)).is_ok());

        let existing = vec![
            owned("a", 1.0, 1024),
            owned("b", 1.0, 1024),
            owned("c", 1.0, 1024),
        ];
        assert!(matches!(
            policy.check(&existing, None, &limits(1.0, 1024)),
            Err(VpsError::QuotaExceeded(_))
        ));
        // Resizing an existing instance is not a new instance
        assert!(policy.check(&existing, Some("a"), &limits(2.0, 2048)).is_ok());
    }

    #[test]
    fn test_cpu_and_memory_totals() {
        let policy = QuotaPolicy::default();
        let existing = vec![owned("a", 4.0, 8192), owned("b", 3.0, 4096)];
        assert!(policy.check(&existing, None, &limits(1.0, 4096)).is_ok());
        assert!(policy.check(&existing, None, &limits(1.5, 1024)).is_err());
        assert!(policy.check(&existing, None, &limits(0.5, 4608)).is_err());
        assert!(policy.check(&existing, Some("b"), &limits(4.0, 8192)).is_ok());
    }
}
