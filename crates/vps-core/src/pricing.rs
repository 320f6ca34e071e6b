use serde::{Deserialize, Serialize};
use vps_common::{ResourceLimits, Result};

/// Monthly credit prices per resource unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceModel {
    pub cpu_per_core: f64,
    pub memory_per_gb: f64,
    pub storage_per_gb: f64,
    /// Published but not charged: bandwidth is not metered per instance.
    pub bandwidth_per_gb: f64,
}

impl Default for PriceModel {
    fn default() -> Self {
        Self {
            cpu_per_core: 50.0,
            memory_per_gb: 25.0,
            storage_per_gb: 1.0,
            bandwidth_per_gb: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub cpu: f64,
    pub memory: f64,
    pub storage: f64,
    pub total: f64,
}

impl PriceModel {
    pub fn breakdown(&self, limits: &ResourceLimits) -> CostBreakdown {
        let cpu = limits.cpu_cores * self.cpu_per_core;
        let memory = limits.memory_gb() * self.memory_per_gb;
        let storage = f64::from(limits.storage_gb) * self.storage_per_gb;
        CostBreakdown {
            cpu,
            memory,
            storage,
            total: cpu + memory + storage,
        }
    }

    pub fn monthly_cost(&self, limits: &ResourceLimits) -> f64 {
        self.breakdown(limits).total
    }

    /// Cost of a validated configuration.
    pub fn estimate(&self, limits: &ResourceLimits) -> Result<CostBreakdown> {
        limits.validate()?;
        Ok(self.breakdown(limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_configuration_costs_95() {
        let limits = ResourceLimits {
            cpu_cores: 1.0,
            memory_mb: 1024,
            storage_gb: 20,
        };
        let cost = PriceModel::default().breakdown(&limits);
        assert_eq!(cost.cpu, 50.0);
        assert_eq!(cost.memory, 25.0);
        assert_eq!(cost.storage, 20.0);
        assert_eq!(cost.total, 95.0);
    }

    #[test]
    fn test_fractional_memory_is_prorated() {
        let limits = ResourceLimits {
            cpu_cores: 0.5,
            memory_mb: 512,
            storage_gb: 10,
        };
        assert_eq!(PriceModel::default().monthly_cost(&limits), 25.0 + 12.5 + 10.0);
    }

    #[test]
    fn test_estimate_rejects_out_of_bounds() {
        let limits = ResourceLimits {
            cpu_cores: 8.0,
            memory_mb: 1024,
            storage_gb: 20,
        };
        assert!(PriceModel::default().estimate(&limits).is_err());
    }
}
