//! Scriptable in-process runtime for tests.
//!
//! Records every call, keeps a tiny container table, and lets a test inject
//! failures or delays per operation.

use crate::{ContainerRuntime, ContainerSpec, ContainerState, RawStats, Result, RuntimeError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use vps_common::ResourceLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Start,
    Stop,
    Restart,
    Remove,
    UpdateLimits,
    Stats,
    Exec,
    Commit,
    Inspect,
}

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub limits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub handle: String,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, MockContainer>,
    calls: Vec<Call>,
    /// Remaining forced failures per op. `None` count means fail forever.
    failures: HashMap<Op, Option<usize>>,
    delays: HashMap<Op, Duration>,
    stats: HashMap<String, RawStats>,
    exec_output: HashMap<String, String>,
    images: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<State>>,
    next_id: Arc<AtomicU64>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: Op, times: usize) {
        self.state().failures.insert(op, Some(times));
    }

    pub fn fail_always(&self, op: Op) {
        self.state().failures.insert(op, None);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn set_delay(&self, op: Op, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    pub fn set_stats(&self, handle: &str, stats: RawStats) {
        self.state().stats.insert(handle.to_string(), stats);
    }

    pub fn set_exec_output(&self, handle: &str, output: impl Into<String>) {
        self.state()
            .exec_output
            .insert(handle.to_string(), output.into());
    }

    pub fn set_running(&self, handle: &str, running: bool) {
        if let Some(container) = self.state().containers.get_mut(handle) {
            container.running = running;
        }
    }

    /// Drop a container behind the core's back.
    pub fn vanish(&self, handle: &str) {
        self.state().containers.remove(handle);
    }

    pub fn container(&self, handle: &str) -> Option<MockContainer> {
        self.state().containers.get(handle).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn is_running(&self, handle: &str) -> bool {
        self.container(handle).is_some_and(|c| c.running)
    }

    pub fn images(&self) -> Vec<String> {
        self.state().images.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, op: Op) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    async fn enter(&self, op: Op, handle: &str) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.calls.push(Call {
                op,
                handle: handle.to_string(),
            });
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        match state.failures.get_mut(&op) {
            Some(None) => Err(RuntimeError::Internal(format!("injected {op:?} failure"))),
            Some(Some(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(RuntimeError::Internal(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn with_container<T>(
        &self,
        handle: &str,
        f: impl FnOnce(&mut MockContainer) -> T,
    ) -> Result<T> {
        let mut state = self.state();
        state
            .containers
            .get_mut(handle)
            .map(f)
            .ok_or_else(|| RuntimeError::ContainerNotFound(handle.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.enter(Op::Create, &spec.name).await?;
        let id = format!("{:064x}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.state().containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                running: true,
                limits: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.enter(Op::Start, handle).await?;
        self.with_container(handle, |c| c.running = true)
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.enter(Op::Stop, handle).await?;
        self.with_container(handle, |c| c.running = false)
    }

    async fn restart(&self, handle: &str) -> Result<()> {
        self.enter(Op::Restart, handle).await?;
        self.with_container(handle, |c| c.running = true)
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.enter(Op::Remove, handle).await?;
        self.state()
            .containers
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::ContainerNotFound(handle.to_string()))
    }

    async fn update_limits(&self, handle: &str, limits: &ResourceLimits) -> Result<()> {
        self.enter(Op::UpdateLimits, handle).await?;
        let limits = *limits;
        self.with_container(handle, |c| c.limits = Some(limits))
    }

    async fn stats(&self, handle: &str) -> Result<RawStats> {
        self.enter(Op::Stats, handle).await?;
        self.with_container(handle, |_| ())?;
        Ok(self.state().stats.get(handle).cloned().unwrap_or_default())
    }

    async fn exec(&self, handle: &str, _cmd: &[String]) -> Result<String> {
        self.enter(Op::Exec, handle).await?;
        self.with_container(handle, |_| ())?;
        self.state()
            .exec_output
            .get(handle)
            .cloned()
            .ok_or_else(|| RuntimeError::Exec("no output scripted".into()))
    }

    async fn commit(&self, handle: &str, repo: &str, tag: &str) -> Result<String> {
        self.enter(Op::Commit, handle).await?;
        self.with_container(handle, |_| ())?;
        let image = format!("{repo}:{tag}");
        self.state().images.push(image.clone());
        Ok(image)
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerState> {
        self.enter(Op::Inspect, handle).await?;
        self.with_container(handle, |c| ContainerState {
            status: if c.running { "running" } else { "exited" }.to_string(),
            running: c.running,
        })
    }
}
