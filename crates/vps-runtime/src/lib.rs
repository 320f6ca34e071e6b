use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use vps_common::{InstanceConfig, ResourceLimits, VpsError, CPU_PERIOD_US};

// Re-export dependencies potentially needed by consumers
pub use bollard;
pub use vps_common as common;

pub mod docker;
pub mod test_utils;
pub mod timeout;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use docker::DockerRuntime;
pub use timeout::TimeoutRuntime;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError),
    #[error("Runtime call `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("Exec failed: {0}")]
    Exec(String),
    #[error("Malformed stats: {0}")]
    MalformedStats(String),
    #[error("Internal runtime error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::ContainerNotFound(_)
                | RuntimeError::DockerApi(BollardError::DockerResponseServerError {
                    status_code: 404,
                    ..
                })
        )
    }
}

// Runtime failures reach callers as a generic failure; detail stays in the message for logs
impl From<RuntimeError> for VpsError {
    fn from(err: RuntimeError) -> Self {
        VpsError::Runtime(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything the runtime needs to instantiate a container for an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub memory_bytes: i64,
    /// Container port (`"22/tcp"`) to host port.
    pub ports: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Restart automatically unless explicitly stopped.
    pub restart_unless_stopped: bool,
}

impl ContainerSpec {
    pub fn for_instance(instance_id: &str, owner: &str, config: &InstanceConfig) -> Self {
        let limits = config.limits();
        let mut labels = BTreeMap::new();
        labels.insert("vps.instance".to_string(), instance_id.to_string());
        labels.insert("vps.owner".to_string(), owner.to_string());

        Self {
            name: instance_id.to_string(),
            image: config.image.clone(),
            cpu_period: CPU_PERIOD_US,
            cpu_quota: limits.cpu_quota(),
            memory_bytes: limits.memory_bytes(),
            ports: config.ports.clone(),
            env: config.env_list(),
            labels,
            restart_unless_stopped: true,
        }
    }

    /// Same instance, different image. Used when restoring from a backup.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Same instance under another container name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Cumulative counters as reported by one non-streaming stats call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStats {
    pub cpu_total_ns: u64,
    pub precpu_total_ns: u64,
    pub system_cpu_ns: u64,
    pub presystem_cpu_ns: u64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
}

/// Operations the lifecycle core needs from a container runtime.
///
/// `start` on a running container and `stop` on a stopped one succeed.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container. Returns the runtime handle.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, handle: &str) -> Result<()>;
    async fn stop(&self, handle: &str) -> Result<()>;
    async fn restart(&self, handle: &str) -> Result<()>;
    async fn remove(&self, handle: &str) -> Result<()>;
    async fn update_limits(&self, handle: &str, limits: &ResourceLimits) -> Result<()>;
    async fn stats(&self, handle: &str) -> Result<RawStats>;
    /// Run a command inside the container and capture stdout.
    async fn exec(&self, handle: &str, cmd: &[String]) -> Result<String>;
    /// Snapshot the container into `repo:tag`. Returns the image reference.
    async fn commit(&self, handle: &str, repo: &str, tag: &str) -> Result<String>;
    async fn inspect(&self, handle: &str) -> Result<ContainerState>;
}
