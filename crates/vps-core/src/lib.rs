// VPS core - instance lifecycle, resource sampling, alerts and billing
pub mod alerts;
pub mod billing;
pub mod config;
pub mod host;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod notify;
pub mod persist;
pub mod pricing;
pub mod quota;
pub mod registry;
pub mod sampler;
pub mod scheduler;

pub use alerts::{AlertEvaluator, Resource, Thresholds};
pub use billing::{BillingDriver, BillingOutcome, BillingReport};
pub use config::VpsConfig;
pub use host::{Collaborators, Purchase, VpsHost};
pub use ledger::{FileLedger, InMemoryLedger, Ledger, LedgerError, Transaction};
pub use lifecycle::{effective_status, InstanceView, LifecycleController, ReconcileReport};
pub use locks::{KeyGuard, KeyedLocks};
pub use notify::{
    ChannelNotifier, LogNotifier, Notification, Notifier, NotifyError, RecordingNotifier,
};
pub use pricing::{CostBreakdown, PriceModel};
pub use quota::QuotaPolicy;
pub use registry::{JsonFileStore, MemoryStore, Registry, RegistryStore};
pub use sampler::{
    cpu_percent, memory_percent, DfProbe, DiskUsageProbe, FileStatsStore, InMemoryStatsStore,
    LatestStats, Sampler, StatsStore,
};
pub use scheduler::{run_periodic, shutdown_channel, CycleGuard, ShutdownSignal, ShutdownTrigger};

pub use vps_common::{
    BackupDescriptor, Failure, FailureKind, InstanceConfig, InstanceRecord, InstanceStatus,
    PeakRecord, ResourceLimits, Result, StatsSample, VpsError,
};
