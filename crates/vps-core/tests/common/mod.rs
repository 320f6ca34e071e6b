#![allow(dead_code)]

use std::sync::Arc;
use vps_core::{
    Collaborators, DfProbe, InMemoryLedger, InMemoryStatsStore, InstanceConfig, Ledger,
    MemoryStore, RecordingNotifier, VpsConfig, VpsHost,
};
use vps_runtime::mock::MockRuntime;

pub const DF_51: &str = "Filesystem     1024-blocks     Used Available Capacity Mounted on\n\
                         overlay           61255652 29389824  28724020      51% /\n";

pub struct Harness {
    pub host: Arc<VpsHost>,
    pub runtime: MockRuntime,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub stats: Arc<InMemoryStatsStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(VpsConfig::default())
    }

    pub fn with_config(config: VpsConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), MockRuntime::new())
    }

    /// Build a host over existing state, as after a process restart.
    pub fn with_store(config: VpsConfig, store: Arc<MemoryStore>, runtime: MockRuntime) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let stats = Arc::new(InMemoryStatsStore::new());
        let runtime_dyn: Arc<dyn vps_runtime::ContainerRuntime> = Arc::new(runtime.clone());

        let host = VpsHost::new(
            config,
            Collaborators {
                runtime: runtime_dyn.clone(),
                disk: Arc::new(DfProbe::new(runtime_dyn)),
                registry_store: store.clone(),
                stats_store: stats.clone(),
                ledger: ledger.clone(),
                notifier: notifier.clone(),
            },
        );

        Self {
            host: Arc::new(host),
            runtime,
            store,
            ledger,
            notifier,
            stats,
        }
    }

    pub async fn fund(&self, owner: &str, amount: f64) {
        self.ledger.credit(owner, amount, "test deposit").await.unwrap();
    }

    pub async fn create(&self, owner: &str) -> String {
        self.host.create(owner, small_config()).await.unwrap()
    }

    pub async fn container_of(&self, id: &str) -> String {
        self.host.get(id).await.unwrap().container_id
    }
}

/// 1 core, 1 GiB, 20 GB: costs 95 credits a month at default prices.
pub fn small_config() -> InstanceConfig {
    InstanceConfig::new(1.0, 1024, 20, "ubuntu:latest")
}
