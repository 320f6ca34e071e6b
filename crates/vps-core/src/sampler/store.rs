//! Sample history and peak tracking.

use crate::persist;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};
use vps_common::{PeakRecord, Result, StatsSample, VpsError};

#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn append(&self, samples: &[StatsSample]) -> Result<()>;
    /// Fold samples into the per-instance peaks with a greatest-of merge.
    async fn merge_peaks(&self, samples: &[StatsSample]) -> Result<()>;
    async fn peak(&self, instance_id: &str) -> Result<Option<PeakRecord>>;
    /// Samples for `instance_id` taken at or after `since`, oldest first.
    async fn history(&self, instance_id: &str, since: DateTime<Utc>) -> Result<Vec<StatsSample>>;
    /// Drop samples older than `cutoff`. Returns how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

fn merge_into(peaks: &mut HashMap<String, PeakRecord>, samples: &[StatsSample]) {
    for sample in samples {
        peaks
            .entry(sample.instance_id.clone())
            .and_modify(|peak| peak.merge(sample))
            .or_insert_with(|| PeakRecord::from_sample(sample));
    }
}

#[derive(Default)]
pub struct InMemoryStatsStore {
    samples: RwLock<Vec<StatsSample>>,
    peaks: RwLock<HashMap<String, PeakRecord>>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }
}

#[async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn append(&self, samples: &[StatsSample]) -> Result<()> {
        self.samples.write().await.extend_from_slice(samples);
        Ok(())
    }

    async fn merge_peaks(&self, samples: &[StatsSample]) -> Result<()> {
        merge_into(&mut *self.peaks.write().await, samples);
        Ok(())
    }

    async fn peak(&self, instance_id: &str) -> Result<Option<PeakRecord>> {
        Ok(self.peaks.read().await.get(instance_id).cloned())
    }

    async fn history(&self, instance_id: &str, since: DateTime<Utc>) -> Result<Vec<StatsSample>> {
        let mut out: Vec<_> = self
            .samples
            .read()
            .await
            .iter()
            .filter(|s| s.instance_id == instance_id && s.timestamp >= since)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut samples = self.samples.write().await;
        let before = samples.len();
        samples.retain(|s| s.timestamp >= cutoff);
        Ok(before - samples.len())
    }
}

/// Samples in an append-only JSON-lines file, peaks in a checksummed file.
pub struct FileStatsStore {
    samples_path: PathBuf,
    peaks_path: PathBuf,
    peaks: RwLock<HashMap<String, PeakRecord>>,
    // Serializes appends against the prune rewrite
    file_lock: Mutex<()>,
}

fn io_err(context: &str, path: &Path, e: impl std::fmt::Display) -> VpsError {
    VpsError::Persistence(format!("{context} {}: {e}", path.display()))
}

impl FileStatsStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| io_err("creating", dir, e))?;
        let samples_path = dir.join("samples.jsonl");
        let peaks_path = dir.join("peaks.json");

        let peaks = match std::fs::read(&peaks_path) {
            Ok(bytes) => match persist::decode_checked(&bytes) {
                Ok(peaks) => peaks,
                Err(e) => {
                    error!(path = %peaks_path.display(), error = %e, "Peak file corrupt, starting fresh");
                    if let Err(e) = persist::quarantine(&peaks_path) {
                        warn!(error = %e, "Could not move corrupt peak file aside");
                    }
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(io_err("reading", &peaks_path, e)),
        };

        Ok(Self {
            samples_path,
            peaks_path,
            peaks: RwLock::new(peaks),
            file_lock: Mutex::new(()),
        })
    }

    async fn read_samples(&self) -> Result<Vec<StatsSample>> {
        let text = match tokio::fs::read_to_string(&self.samples_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("reading", &self.samples_path, e)),
        };

        let mut samples = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StatsSample>(line) {
                Ok(sample) => samples.push(sample),
                // A torn final line after a crash is expected; skip it
                Err(e) => warn!(line = lineno + 1, error = %e, "Skipping unreadable sample line"),
            }
        }
        Ok(samples)
    }
}

#[async_trait]
impl StatsStore for FileStatsStore {
    async fn append(&self, samples: &[StatsSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for sample in samples {
            serde_json::to_writer(&mut buf, sample)
                .map_err(|e| VpsError::Persistence(e.to_string()))?;
            buf.push(b'\n');
        }

        let _guard = self.file_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.samples_path)
            .await
            .map_err(|e| io_err("opening", &self.samples_path, e))?;
        file.write_all(&buf)
            .await
            .map_err(|e| io_err("appending to", &self.samples_path, e))?;
        file.flush()
            .await
            .map_err(|e| io_err("flushing", &self.samples_path, e))?;
        debug!(count = samples.len(), "Samples appended");
        Ok(())
    }

    async fn merge_peaks(&self, samples: &[StatsSample]) -> Result<()> {
        let mut current = self.peaks.write().await;
        let mut next = current.clone();
        merge_into(&mut next, samples);

        let bytes =
            persist::encode_checked(&next).map_err(|e| VpsError::Persistence(e.to_string()))?;
        let path = self.peaks_path.clone();
        tokio::task::spawn_blocking(move || persist::write_atomic(&path, &bytes))
            .await
            .map_err(|e| VpsError::Persistence(e.to_string()))?
            .map_err(|e| io_err("writing", &self.peaks_path, e))?;

        *current = next;
        Ok(())
    }

    async fn peak(&self, instance_id: &str) -> Result<Option<PeakRecord>> {
        Ok(self.peaks.read().await.get(instance_id).cloned())
    }

    async fn history(&self, instance_id: &str, since: DateTime<Utc>) -> Result<Vec<StatsSample>> {
        let mut out: Vec<_> = self
            .read_samples()
            .await?
            .into_iter()
            .filter(|s| s.instance_id == instance_id && s.timestamp >= since)
            .collect();
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.file_lock.lock().await;
        let samples = self.read_samples().await?;
        let before = samples.len();
        let kept: Vec<_> = samples
            .into_iter()
            .filter(|s| s.timestamp >= cutoff)
            .collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for sample in &kept {
            serde_json::to_writer(&mut buf, sample)
                .map_err(|e| VpsError::Persistence(e.to_string()))?;
            buf.push(b'\n');
        }
        let path = self.samples_path.clone();
        tokio::task::spawn_blocking(move || persist::write_atomic(&path, &buf))
            .await
            .map_err(|e| VpsError::Persistence(e.to_string()))?
            .map_err(|e| io_err("rewriting", &self.samples_path, e))?;
        Ok(removed)
    }
}
