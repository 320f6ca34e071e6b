//! Periodic resource sampling.
//!
//! Each cycle inspects every registered instance, turns the runtime's raw
//! counters into percentages, and fans the results out to the latest-stats
//! cache, the durable history and the peak table. One instance failing
//! never stops the rest of the cycle.

pub mod disk;
pub mod store;

use crate::registry::Registry;
use crate::scheduler::CycleGuard;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, warn};
use vps_common::{InstanceRecord, PeakRecord, Result, StatsSample};
use vps_runtime::{ContainerRuntime, RawStats, RuntimeError};

pub use disk::{parse_df_percent, DfProbe, DiskUsageProbe};
pub use store::{FileStatsStore, InMemoryStatsStore, StatsStore};

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// CPU utilisation between the two cumulative readings in `raw`.
/// A zero system delta reports 0 instead of dividing by zero.
pub fn cpu_percent(raw: &RawStats) -> f64 {
    let cpu_delta = raw.cpu_total_ns.saturating_sub(raw.precpu_total_ns);
    let system_delta = raw.system_cpu_ns.saturating_sub(raw.presystem_cpu_ns);
    if system_delta == 0 {
        return 0.0;
    }
    round2(cpu_delta as f64 / system_delta as f64 * 100.0)
}

pub fn memory_percent(raw: &RawStats) -> f64 {
    if raw.memory_limit_bytes == 0 {
        return 0.0;
    }
    round2(raw.memory_used_bytes as f64 / raw.memory_limit_bytes as f64 * 100.0)
}

/// Bounded map of instance id to its most recent sample.
pub struct LatestStats {
    inner: Mutex<LruCache<String, StatsSample>>,
}

const MIN_CACHE: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(n) => n,
    None => unreachable!(),
};

impl Default for LatestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(MIN_CACHE)),
        }
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<String, StatsSample>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, instance_id: &str) -> Option<StatsSample> {
        self.cache().get(instance_id).cloned()
    }

    pub fn put(&self, sample: StatsSample) {
        self.cache().put(sample.instance_id.clone(), sample);
    }

    pub fn evict(&self, instance_id: &str) {
        self.cache().pop(instance_id);
    }

    /// Keep room for at least `tracked` instances.
    pub fn resize(&self, tracked: usize) {
        let cap = NonZeroUsize::new(tracked).map_or(MIN_CACHE, |n| n.max(MIN_CACHE));
        let mut cache = self.cache();
        if cache.cap() != cap {
            cache.resize(cap);
        }
    }

    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub samples: Vec<StatsSample>,
    pub failed: Vec<String>,
}

pub struct Sampler {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    disk: Arc<dyn DiskUsageProbe>,
    latest: Arc<LatestStats>,
    store: Arc<dyn StatsStore>,
    concurrency: usize,
    retention: chrono::Duration,
    guard: CycleGuard,
}

impl Sampler {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        disk: Arc<dyn DiskUsageProbe>,
        latest: Arc<LatestStats>,
        store: Arc<dyn StatsStore>,
    ) -> Self {
        Self {
            registry,
            runtime,
            disk,
            latest,
            store,
            concurrency: 8,
            retention: chrono::Duration::days(30),
            guard: CycleGuard::new("sampler"),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Run one sampling cycle. `None` when the previous cycle is still running.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let _token = self.guard.try_enter()?;
        Some(self.sample_all(Utc::now()).await)
    }

    #[instrument(skip(self))]
    pub async fn sample_all(&self, now: DateTime<Utc>) -> CycleReport {
        let records = self.registry.list().await;
        self.latest.resize(records.len());

        let results: Vec<(String, std::result::Result<StatsSample, RuntimeError>)> =
            stream::iter(records)
                .map(|record| async move {
                    let result = self.sample_instance(&record, now).await;
                    (record.id, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut report = CycleReport::default();
        for (instance_id, result) in results {
            match result {
                Ok(sample) => {
                    if !self.still_current(&sample).await {
                        debug!(%instance_id, "Instance deleted or restored mid-cycle, dropping sample");
                        continue;
                    }
                    self.latest.put(sample.clone());
                    report.samples.push(sample);
                }
                Err(e) => {
                    warn!(%instance_id, error = %e, "Sampling failed, skipping instance this cycle");
                    report.failed.push(instance_id);
                }
            }
        }

        if let Err(e) = self.store.append(&report.samples).await {
            error!(error = %e, "Failed to append samples to history");
        }
        if let Err(e) = self.store.merge_peaks(&report.samples).await {
            error!(error = %e, "Failed to update peak records");
        }

        debug!(
            sampled = report.samples.len(),
            failed = report.failed.len(),
            "Sampling cycle complete"
        );
        report
    }

    // The record may have been deleted, or moved to a new container, while
    // this sample was in flight
    async fn still_current(&self, sample: &StatsSample) -> bool {
        self.registry
            .get(&sample.instance_id)
            .await
            .is_ok_and(|record| record.container_id == sample.container_id)
    }

    async fn sample_instance(
        &self,
        record: &InstanceRecord,
        now: DateTime<Utc>,
    ) -> std::result::Result<StatsSample, RuntimeError> {
        let state = self.runtime.inspect(&record.container_id).await?;
        let mut sample = StatsSample {
            instance_id: record.id.clone(),
            container_id: record.container_id.clone(),
            timestamp: now,
            status: state.status,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_used_bytes: 0,
            memory_total_bytes: 0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            disk_percent: 0.0,
        };
        // Nothing to measure in a stopped container
        if !state.running {
            return Ok(sample);
        }

        let raw = self.runtime.stats(&record.container_id).await?;
        let disk_percent = self.disk.root_usage_percent(&record.container_id).await?;

        sample.cpu_percent = cpu_percent(&raw);
        sample.memory_percent = memory_percent(&raw);
        sample.memory_used_bytes = raw.memory_used_bytes;
        sample.memory_total_bytes = raw.memory_limit_bytes;
        sample.network_rx_bytes = raw.rx_bytes;
        sample.network_tx_bytes = raw.tx_bytes;
        sample.disk_percent = disk_percent;
        Ok(sample)
    }

    /// Drop history older than the retention window.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.prune_before(now - self.retention).await?;
        if removed > 0 {
            info!(removed, "Pruned old samples");
        }
        Ok(removed)
    }

    pub fn latest(&self, instance_id: &str) -> Option<StatsSample> {
        self.latest.get(instance_id)
    }

    /// Samples from the last `hours` hours, oldest first.
    pub async fn history(&self, instance_id: &str, hours: u32) -> Result<Vec<StatsSample>> {
        let since = Utc::now() - chrono::Duration::hours(i64::from(hours));
        self.store.history(instance_id, since).await
    }

    pub async fn peak(&self, instance_id: &str) -> Result<Option<PeakRecord>> {
        self.store.peak(instance_id).await
    }
}
