//! Bounded-time wrapper around any runtime.
//!
//! A runtime call that never returns would otherwise stall the periodic
//! sampling and billing loops. Expiry is reported as that call's failure.

use crate::{ContainerRuntime, ContainerSpec, ContainerState, RawStats, Result, RuntimeError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use vps_common::ResourceLimits;

pub struct TimeoutRuntime<R> {
    inner: R,
    call_timeout: Duration,
    create_timeout: Duration,
}

impl<R: ContainerRuntime> TimeoutRuntime<R> {
    pub fn new(inner: R, call_timeout: Duration) -> Self {
        Self {
            inner,
            call_timeout,
            create_timeout: call_timeout,
        }
    }

    /// Separate bound for `create`, which may pull an image first.
    pub fn with_create_timeout(mut self, create_timeout: Duration) -> Self {
        self.create_timeout = create_timeout;
        self
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn bounded<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.bounded_by(self.call_timeout, op, fut).await
    }

    async fn bounded_by<T>(
        &self,
        limit: Duration,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout = ?limit, "Runtime call timed out");
                Err(RuntimeError::Timeout { op, after: limit })
            }
        }
    }
}

#[async_trait]
impl<R: ContainerRuntime> ContainerRuntime for TimeoutRuntime<R> {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.bounded_by(self.create_timeout, "create", self.inner.create(spec))
            .await
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.bounded("start", self.inner.start(handle)).await
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.bounded("stop", self.inner.stop(handle)).await
    }

    async fn restart(&self, handle: &str) -> Result<()> {
        self.bounded("restart", self.inner.restart(handle)).await
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.bounded("remove", self.inner.remove(handle)).await
    }

    async fn update_limits(&self, handle: &str, limits: &ResourceLimits) -> Result<()> {
        self.bounded("update_limits", self.inner.update_limits(handle, limits))
            .await
    }

    async fn stats(&self, handle: &str) -> Result<RawStats> {
        self.bounded("stats", self.inner.stats(handle)).await
    }

    async fn exec(&self, handle: &str, cmd: &[String]) -> Result<String> {
        self.bounded("exec", self.inner.exec(handle, cmd)).await
    }

    async fn commit(&self, handle: &str, repo: &str, tag: &str) -> Result<String> {
        self.bounded("commit", self.inner.commit(handle, repo, tag)).await
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerState> {
        self.bounded("inspect", self.inner.inspect(handle)).await
    }
}
