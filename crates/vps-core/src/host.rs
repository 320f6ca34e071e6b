//! Wires the registry, controller, sampler, alerts and billing together and
//! exposes the operation set a command front-end calls into.

use crate::alerts::{AlertEvaluator, Resource, Thresholds};
use crate::billing::BillingDriver;
use crate::config::VpsConfig;
use crate::ledger::Ledger;
use crate::lifecycle::{InstanceView, LifecycleController, ReconcileReport};
use crate::locks::KeyedLocks;
use crate::notify::Notifier;
use crate::pricing::{CostBreakdown, PriceModel};
use crate::registry::{Registry, RegistryStore};
use crate::sampler::{DiskUsageProbe, LatestStats, Sampler, StatsStore};
use crate::scheduler::{run_periodic, ShutdownSignal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use vps_common::{
    BackupDescriptor, InstanceConfig, InstanceRecord, PeakRecord, ResourceLimits, Result,
    StatsSample, VpsError,
};
use vps_runtime::ContainerRuntime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub instance_id: String,
    pub cost: f64,
    pub next_billing: DateTime<Utc>,
}

/// Collaborators supplied by the embedding process.
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub disk: Arc<dyn DiskUsageProbe>,
    pub registry_store: Arc<dyn RegistryStore>,
    pub stats_store: Arc<dyn StatsStore>,
    pub ledger: Arc<dyn Ledger>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct VpsHost {
    config: VpsConfig,
    prices: PriceModel,
    registry: Arc<Registry>,
    controller: Arc<LifecycleController>,
    sampler: Arc<Sampler>,
    alerts: Arc<AlertEvaluator>,
    billing: Arc<BillingDriver>,
    ledger: Arc<dyn Ledger>,
}

impl VpsHost {
    pub fn new(config: VpsConfig, parts: Collaborators) -> Self {
        let registry = Arc::new(Registry::open(parts.registry_store));
        let locks = Arc::new(KeyedLocks::new());
        let latest = Arc::new(LatestStats::new());
        let prices = config.billing.prices;

        let controller = Arc::new(LifecycleController::new(
            registry.clone(),
            parts.runtime.clone(),
            locks.clone(),
            latest.clone(),
            config.quotas,
        ));
        let sampler = Arc::new(
            Sampler::new(
                registry.clone(),
                parts.runtime,
                parts.disk,
                latest,
                parts.stats_store,
            )
            .with_concurrency(config.sampler.concurrency)
            .with_retention(config.sampler.retention()),
        );
        let alerts = Arc::new(
            AlertEvaluator::new(
                registry.clone(),
                parts.notifier.clone(),
                Thresholds::from(&config.alerts),
            )
            .with_cooldown(config.alerts.cooldown()),
        );
        let billing = Arc::new(
            BillingDriver::new(
                registry.clone(),
                locks,
                controller.clone(),
                parts.ledger.clone(),
                parts.notifier,
                prices,
            )
            .with_periods(
                config.billing.billing_interval(),
                config.billing.grace_period(),
            ),
        );

        Self {
            config,
            prices,
            registry,
            controller,
            sampler,
            alerts,
            billing,
            ledger: parts.ledger,
        }
    }

    pub fn config(&self) -> &VpsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }

    pub fn alerts(&self) -> &Arc<AlertEvaluator> {
        &self.alerts
    }

    pub fn billing(&self) -> &Arc<BillingDriver> {
        &self.billing
    }

    /// A configuration with the host's default image.
    pub fn default_instance_config(&self, limits: ResourceLimits) -> InstanceConfig {
        InstanceConfig::new(
            limits.cpu_cores,
            limits.memory_mb,
            limits.storage_gb,
            self.config.runtime.default_image.clone(),
        )
    }

    pub fn estimate_cost(&self, limits: &ResourceLimits) -> Result<CostBreakdown> {
        self.prices.estimate(limits)
    }

    /// Charge the first month and create the instance, refunding the charge
    /// if creation fails.
    #[instrument(skip(self, config))]
    pub async fn purchase(&self, owner: &str, config: InstanceConfig) -> Result<Purchase> {
        config.validate()?;
        let limits = config.limits();
        self.controller.check_quota(owner, &limits).await?;

        let cost = self.prices.monthly_cost(&limits);
        let balance = self.ledger.balance(owner).await?;
        if balance < cost {
            return Err(VpsError::InsufficientFunds(format!(
                "this configuration costs {cost:.2} credits and your balance is {balance:.2}"
            )));
        }
        let tx = self
            .ledger
            .debit(owner, cost, "VPS Purchase - initial month")
            .await?;

        match self.controller.create(owner, config).await {
            Ok(instance_id) => {
                let record = self.registry.get(&instance_id).await?;
                info!(%instance_id, cost, "Instance purchased");
                Ok(Purchase {
                    next_billing: record.next_billing_at(self.config.billing.billing_interval()),
                    instance_id,
                    cost,
                })
            }
            Err(e) => {
                if let Err(refund) = self
                    .ledger
                    .credit(owner, tx.amount, "Refund: VPS creation failed")
                    .await
                {
                    error!(%owner, amount = tx.amount, transaction = %tx.id, error = %refund, "Purchase refund failed");
                }
                Err(e)
            }
        }
    }

    pub async fn create(&self, owner: &str, config: InstanceConfig) -> Result<String> {
        self.controller.create(owner, config).await
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.controller.start(id).await
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.controller.stop(id).await
    }

    pub async fn restart(&self, id: &str) -> Result<()> {
        self.controller.restart(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.controller.delete(id).await
    }

    pub async fn get(&self, id: &str) -> Result<InstanceRecord> {
        self.controller.get(id).await
    }

    pub async fn list_for_user(&self, owner: &str) -> Vec<InstanceView> {
        self.controller.list_for_user(owner).await
    }

    pub async fn update_config(&self, id: &str, limits: ResourceLimits) -> Result<InstanceRecord> {
        self.controller.update_config(id, limits).await
    }

    pub async fn create_backup(&self, id: &str, label: Option<String>) -> Result<BackupDescriptor> {
        self.controller.create_backup(id, label).await
    }

    pub async fn restore_backup(&self, id: &str, backup_image: &str) -> Result<InstanceRecord> {
        self.controller.restore_backup(id, backup_image).await
    }

    pub fn latest_stats(&self, id: &str) -> Option<StatsSample> {
        self.sampler.latest(id)
    }

    pub async fn history(&self, id: &str, hours: u32) -> Result<Vec<StatsSample>> {
        self.registry.get(id).await?;
        self.sampler.history(id, hours).await
    }

    pub async fn peak(&self, id: &str) -> Result<Option<PeakRecord>> {
        self.registry.get(id).await?;
        self.sampler.peak(id).await
    }

    /// Alert lines for the latest sample of `id`. Empty when never sampled.
    pub async fn active_alerts(&self, id: &str) -> Result<Vec<String>> {
        self.registry.get(id).await?;
        Ok(self
            .sampler
            .latest(id)
            .map(|sample| self.alerts.active_alerts(&sample))
            .unwrap_or_default())
    }

    pub fn set_alert_threshold(&self, resource: Resource, value: f64) -> Result<()> {
        self.alerts.set_threshold(resource, value)
    }

    pub async fn reconcile(&self) -> ReconcileReport {
        self.controller.reconcile().await
    }

    /// Sample every instance and alert on the fresh samples.
    pub async fn sample_and_alert(&self) {
        if let Some(report) = self.sampler.run_cycle().await {
            self.alerts.dispatch(&report.samples, Utc::now()).await;
        }
    }

    /// Start the sampling, pruning and billing loops.
    pub fn spawn_background(self: &Arc<Self>, shutdown: ShutdownSignal) -> Vec<JoinHandle<()>> {
        let sampling = {
            let host = self.clone();
            tokio::spawn(run_periodic(
                "sampler",
                self.config.sampler.interval(),
                shutdown.clone(),
                move || {
                    let host = host.clone();
                    async move { host.sample_and_alert().await }
                },
            ))
        };

        let pruning = {
            let sampler = self.sampler.clone();
            tokio::spawn(run_periodic(
                "prune",
                self.config.sampler.prune_interval(),
                shutdown.clone(),
                move || {
                    let sampler = sampler.clone();
                    async move {
                        if let Err(e) = sampler.prune(Utc::now()).await {
                            error!(error = %e, "Pruning sample history failed");
                        }
                    }
                },
            ))
        };

        let billing = {
            let billing = self.billing.clone();
            tokio::spawn(run_periodic(
                "billing",
                self.config.billing.scan_interval(),
                shutdown,
                move || {
                    let billing = billing.clone();
                    async move {
                        if let Some(report) = billing.run_cycle().await {
                            if !report.errors.is_empty() {
                                error!(failed = report.errors.len(), "Billing scan finished with errors");
                            }
                        }
                    }
                },
            ))
        };

        vec![sampling, pruning, billing]
    }
}
