//! Instance lifecycle operations.
//!
//! Every operation on an existing instance holds that instance's lock from
//! reading its record, through the runtime call, to persisting the result.
//! Creates and resizes also hold the owner's lock so quota checks cannot race.

use crate::locks::{owner_key, KeyedLocks};
use crate::quota::QuotaPolicy;
use crate::registry::Registry;
use crate::sampler::LatestStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use vps_common::{
    new_instance_id, BackupDescriptor, InstanceConfig, InstanceRecord, InstanceStatus,
    ResourceLimits, Result, StatsSample, VpsError,
};
use vps_runtime::{ContainerRuntime, ContainerSpec, RuntimeError};

/// A record joined with its most recent sample. `stats` is `None` when the
/// instance has not been sampled successfully; it is never zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub record: InstanceRecord,
    pub status: InstanceStatus,
    pub stats: Option<StatsSample>,
}

/// Status shown to users: the registry owns suspension, the runtime owns
/// running versus stopped.
pub fn effective_status(record: &InstanceRecord, stats: Option<&StatsSample>) -> InstanceStatus {
    if record.is_suspended() {
        return InstanceStatus::Suspended;
    }
    match stats {
        Some(sample) if sample.status == "running" => InstanceStatus::Running,
        Some(_) => InstanceStatus::Stopped,
        None => record.status,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub checked: usize,
    pub corrected: usize,
    pub missing: usize,
}

pub struct LifecycleController {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<KeyedLocks>,
    latest: Arc<LatestStats>,
    quotas: QuotaPolicy,
}

// Stop or remove succeeded, or the container was already gone
fn tolerate_missing(result: std::result::Result<(), RuntimeError>) -> std::result::Result<(), RuntimeError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl LifecycleController {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        locks: Arc<KeyedLocks>,
        latest: Arc<LatestStats>,
        quotas: QuotaPolicy,
    ) -> Self {
        Self {
            registry,
            runtime,
            locks,
            latest,
            quotas,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<KeyedLocks> {
        &self.locks
    }

    fn runtime_failure(&self, op: &str, record: &InstanceRecord, err: RuntimeError) -> VpsError {
        error!(
            op,
            instance_id = %record.id,
            container_id = %record.short_container_id(),
            error = %err,
            "Runtime call failed"
        );
        err.into()
    }

    /// Quota check for a prospective new instance, without creating anything.
    pub async fn check_quota(&self, owner: &str, limits: &ResourceLimits) -> Result<()> {
        let existing = self.registry.list_for_owner(owner).await;
        self.quotas.check(&existing, None, limits)
    }

    #[instrument(skip(self, config), fields(cpu = config.cpu_cores, memory_mb = config.memory_mb))]
    pub async fn create(&self, owner: &str, config: InstanceConfig) -> Result<String> {
        config.validate()?;
        let _owner_guard = self.locks.acquire(&owner_key(owner)).await;
        self.check_quota(owner, &config.limits()).await?;

        let id = new_instance_id();
        let spec = ContainerSpec::for_instance(&id, owner, &config);
        let container_id = self.runtime.create(&spec).await.map_err(|e| {
            error!(instance_id = %id, error = %e, "Container creation failed");
            VpsError::from(e)
        })?;

        let record = InstanceRecord::new(
            id.clone(),
            container_id.clone(),
            owner.to_string(),
            config,
            Utc::now(),
        );
        if let Err(e) = self.registry.put(record).await {
            // No record means no container either
            if let Err(rm) = self.runtime.remove(&container_id).await {
                error!(%container_id, error = %rm, "Could not remove container after failed persist; orphaned");
            }
            return Err(e);
        }

        info!(instance_id = %id, %container_id, "Instance created");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<InstanceRecord> {
        self.registry.get(id).await
    }

    pub async fn list_for_user(&self, owner: &str) -> Vec<InstanceView> {
        self.registry
            .list_for_owner(owner)
            .await
            .into_iter()
            .map(|record| {
                let stats = self.latest.get(&record.id);
                InstanceView {
                    status: effective_status(&record, stats.as_ref()),
                    record,
                    stats,
                }
            })
            .collect()
    }

    async fn set_status(&self, id: &str, status: InstanceStatus) -> Result<()> {
        self.registry.update(id, |r| r.status = status).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn start(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let record = self.registry.get(id).await?;
        if record.is_suspended() {
            return Err(VpsError::Suspended(id.to_string()));
        }

        self.runtime
            .start(&record.container_id)
            .await
            .map_err(|e| self.runtime_failure("start", &record, e))?;
        self.set_status(id, InstanceStatus::Running).await?;
        info!("Instance started");
        Ok(())
    }

    /// Stopping an already-stopped instance succeeds.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let record = self.registry.get(id).await?;

        self.runtime
            .stop(&record.container_id)
            .await
            .map_err(|e| self.runtime_failure("stop", &record, e))?;
        // A suspended instance stays suspended
        if !record.is_suspended() && record.status != InstanceStatus::Stopped {
            self.set_status(id, InstanceStatus::Stopped).await?;
        }
        info!("Instance stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn restart(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let record = self.registry.get(id).await?;
        if record.is_suspended() {
            return Err(VpsError::Suspended(id.to_string()));
        }

        self.runtime
            .restart(&record.container_id)
            .await
            .map_err(|e| self.runtime_failure("restart", &record, e))?;
        if record.status != InstanceStatus::Running {
            self.set_status(id, InstanceStatus::Running).await?;
        }
        info!("Instance restarted");
        Ok(())
    }

    /// Stop, remove the container, then drop the record. If the container
    /// cannot be removed the record is kept so the delete can be retried.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let guard = self.locks.acquire(id).await;
        let record = self.registry.get(id).await?;

        tolerate_missing(self.runtime.stop(&record.container_id).await)
            .map_err(|e| self.runtime_failure("stop", &record, e))?;
        tolerate_missing(self.runtime.remove(&record.container_id).await)
            .map_err(|e| self.runtime_failure("remove", &record, e))?;
        self.registry.remove(id).await?;
        self.latest.evict(id);

        drop(guard);
        info!("Instance deleted");
        Ok(())
    }

    /// Resize CPU and memory: stop, apply limits, persist, start.
    ///
    /// If the limits cannot be applied the container is started again
    /// unchanged. If the new configuration cannot be persisted the old limits
    /// are put back. If the final start fails the instance is left stopped with the
    /// new limits in place.
    #[instrument(skip(self))]
    pub async fn update_config(&self, id: &str, limits: ResourceLimits) -> Result<InstanceRecord> {
        limits.validate()?;
        let owner = self.registry.get(id).await?.owner;
        let _owner_guard = self.locks.acquire(&owner_key(&owner)).await;
        let _guard = self.locks.acquire(id).await;

        let record = self.registry.get(id).await?;
        if record.is_suspended() {
            return Err(VpsError::Suspended(id.to_string()));
        }
        let existing = self.registry.list_for_owner(&record.owner).await;
        self.quotas.check(&existing, Some(id), &limits)?;

        let old_limits = record.config.limits();
        tolerate_missing(self.runtime.stop(&record.container_id).await)
            .map_err(|e| self.runtime_failure("stop", &record, e))?;
        if let Err(e) = self.runtime.update_limits(&record.container_id, &limits).await {
            let err = self.runtime_failure("update_limits", &record, e);
            // Limits unchanged: bring the container back as it was
            if record.status == InstanceStatus::Running {
                if let Err(start) = self.runtime.start(&record.container_id).await {
                    error!(error = %start, "Restart after failed resize failed");
                }
            }
            return Err(err);
        }

        let merged = record.config.clone().with_limits(limits);
        let updated = match self
            .registry
            .update(id, |r| {
                r.config = merged;
                r.status = InstanceStatus::Stopped;
            })
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!(error = %e, "Could not persist new limits, reverting container");
                if let Err(revert) = self
                    .runtime
                    .update_limits(&record.container_id, &old_limits)
                    .await
                {
                    error!(error = %revert, "Reverting limits failed; container and record disagree");
                }
                if let Err(start) = self.runtime.start(&record.container_id).await {
                    error!(error = %start, "Restart after failed resize failed");
                }
                return Err(e);
            }
        };

        self.runtime
            .start(&updated.container_id)
            .await
            .map_err(|e| self.runtime_failure("start", &updated, e))?;
        let updated = self
            .registry
            .update(id, |r| r.status = InstanceStatus::Running)
            .await?;
        info!(cpu = limits.cpu_cores, memory_mb = limits.memory_mb, "Instance resized");
        Ok(updated)
    }

    /// Snapshot the running container into a tagged image.
    #[instrument(skip(self))]
    pub async fn create_backup(&self, id: &str, label: Option<String>) -> Result<BackupDescriptor> {
        let _guard = self.locks.acquire(id).await;
        let record = self.registry.get(id).await?;

        let now = Utc::now();
        let tag = now.format("%Y%m%d_%H%M%S_%3f").to_string();
        let repo = format!("vps-backup-{}", record.id);
        let image = self
            .runtime
            .commit(&record.container_id, &repo, &tag)
            .await
            .map_err(|e| self.runtime_failure("commit", &record, e))?;

        let descriptor = BackupDescriptor {
            id: image,
            created_at: now,
            label: label.unwrap_or_else(|| format!("{}_backup_{tag}", record.id)),
        };
        let stored = descriptor.clone();
        if let Err(e) = self
            .registry
            .update(id, move |r| r.backups.push(stored))
            .await
        {
            warn!(image = %descriptor.id, "Backup image created but not recorded");
            return Err(e);
        }

        info!(image = %descriptor.id, "Backup created");
        Ok(descriptor)
    }

    /// Replace the instance's container with one built from a backup image.
    /// The instance id is unchanged; only its container handle moves.
    #[instrument(skip(self))]
    pub async fn restore_backup(&self, id: &str, backup_image: &str) -> Result<InstanceRecord> {
        let _guard = self.locks.acquire(id).await;
        let record = self.registry.get(id).await?;
        if record.is_suspended() {
            return Err(VpsError::Suspended(id.to_string()));
        }
        if !record.backups.iter().any(|b| b.id == backup_image) {
            return Err(VpsError::NotFound(format!("backup {backup_image} of {id}")));
        }

        let old_container = record.container_id.clone();
        tolerate_missing(self.runtime.stop(&old_container).await)
            .map_err(|e| self.runtime_failure("stop", &record, e))?;

        let spec = ContainerSpec::for_instance(&record.id, &record.owner, &record.config)
            .with_image(backup_image)
            .with_name(format!("{}-{}", record.id, Utc::now().timestamp_millis()));
        let new_container = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = self.runtime_failure("create", &record, e);
                if let Err(start) = self.runtime.start(&old_container).await {
                    error!(error = %start, "Could not restart previous container after failed restore");
                }
                return Err(err);
            }
        };

        let handle = new_container.clone();
        let updated = match self
            .registry
            .update(id, move |r| {
                r.container_id = handle;
                r.status = InstanceStatus::Running;
            })
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                if let Err(rm) = self.runtime.remove(&new_container).await {
                    error!(container_id = %new_container, error = %rm, "Orphaned restored container");
                }
                if let Err(start) = self.runtime.start(&old_container).await {
                    error!(error = %start, "Could not restart previous container after failed restore");
                }
                return Err(e);
            }
        };

        if let Err(e) = self.runtime.remove(&old_container).await {
            warn!(container_id = %old_container, error = %e, "Previous container left behind after restore");
        }
        self.latest.evict(id);
        info!(container_id = %new_container, "Instance restored from backup");
        Ok(updated)
    }

    /// Suspend an overdue instance whose grace period ended before `now`.
    ///
    /// Re-checks the record under the instance lock and returns `None` when
    /// it no longer qualifies (paid, already suspended or deleted meanwhile).
    #[instrument(skip(self))]
    pub async fn suspend_overdue(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>> {
        let _guard = self.locks.acquire(id).await;
        let record = match self.registry.get(id).await {
            Ok(record) => record,
            Err(VpsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if record.is_suspended() || !record.grace_expired(now) {
            return Ok(None);
        }

        tolerate_missing(self.runtime.stop(&record.container_id).await)
            .map_err(|e| self.runtime_failure("stop", &record, e))?;
        let updated = self
            .registry
            .update(id, |r| {
                r.status = InstanceStatus::Suspended;
                r.suspended_at = Some(now);
            })
            .await?;
        warn!(owner = %updated.owner, "Instance suspended for non-payment");
        Ok(Some(updated))
    }

    /// Align cached statuses with the runtime after a restart of this process.
    /// Suspended instances found running are stopped again.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for record in self.registry.list().await {
            let _guard = self.locks.acquire(&record.id).await;
            report.checked += 1;

            let state = match self.runtime.inspect(&record.container_id).await {
                Ok(state) => state,
                Err(e) if e.is_not_found() => {
                    warn!(instance_id = %record.id, container_id = %record.short_container_id(), "Container missing for registered instance");
                    report.missing += 1;
                    continue;
                }
                Err(e) => {
                    warn!(instance_id = %record.id, error = %e, "Could not inspect container");
                    continue;
                }
            };

            if record.is_suspended() {
                if state.running {
                    match self.runtime.stop(&record.container_id).await {
                        Ok(()) => report.corrected += 1,
                        Err(e) => error!(instance_id = %record.id, error = %e, "Could not stop suspended instance"),
                    }
                }
                continue;
            }

            let actual = if state.running {
                InstanceStatus::Running
            } else {
                InstanceStatus::Stopped
            };
            if actual != record.status {
                match self.set_status(&record.id, actual).await {
                    Ok(()) => report.corrected += 1,
                    Err(e) => error!(instance_id = %record.id, error = %e, "Could not persist reconciled status"),
                }
            }
        }

        info!(
            checked = report.checked,
            corrected = report.corrected,
            missing = report.missing,
            "Reconciled registry with runtime"
        );
        report
    }
}
