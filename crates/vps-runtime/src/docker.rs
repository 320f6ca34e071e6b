//! Docker-backed container runtime.

use crate::{ContainerRuntime, ContainerSpec, ContainerState, RawStats, Result, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use vps_common::ResourceLimits;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
    stop_timeout_secs: i64,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>, stop_timeout_secs: i64) -> Self {
        Self {
            docker,
            stop_timeout_secs,
        }
    }

    pub fn connect_local(stop_timeout_secs: i64) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(Arc::new(docker), stop_timeout_secs))
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    /// Pull `image` unless it is already present locally. Backup images
    /// produced by `commit` are always local and never pulled.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        let (from_image, tag) = split_image_ref(image);
        info!(%from_image, %tag, "Pulling image");
        let progress: Vec<_> = self
            .docker
            .create_image(
                Some(CreateImageOptions {
                    from_image,
                    tag,
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect()
            .await?;
        debug!(image, events = progress.len(), "Image pulled");
        Ok(())
    }
}

/// Split an image reference into repository and tag, defaulting the tag to
/// `latest`. A digest reference is passed through whole with an empty tag.
pub(crate) fn split_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    // A colon before the last slash belongs to a registry port
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

fn classify(handle: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::ContainerNotFound(handle.to_string()),
        other => RuntimeError::DockerApi(other),
    }
}

// Docker answers 304 when the container is already in the requested state
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn normalize_port(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{port}/tcp")
    }
}

fn raw_stats(stats: &Stats) -> RawStats {
    let (rx_bytes, tx_bytes) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks.values().fold((0u64, 0u64), |(rx, tx), net| {
                (rx.saturating_add(net.rx_bytes), tx.saturating_add(net.tx_bytes))
            })
        })
        .unwrap_or_default();

    RawStats {
        cpu_total_ns: stats.cpu_stats.cpu_usage.total_usage,
        precpu_total_ns: stats.precpu_stats.cpu_usage.total_usage,
        system_cpu_ns: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        presystem_cpu_ns: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        memory_used_bytes: stats.memory_stats.usage.unwrap_or(0),
        memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
        rx_bytes,
        tx_bytes,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .keys()
            .map(|port| (normalize_port(port), HashMap::new()))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|(container_port, host_port)| {
                (
                    normalize_port(container_port),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.clone()),
                    }]),
                )
            })
            .collect();

        let restart_policy = spec.restart_unless_stopped.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        });

        let host_config = HostConfig {
            cpu_period: Some(spec.cpu_period),
            cpu_quota: Some(spec.cpu_quota),
            memory: Some(spec.memory_bytes),
            port_bindings: Some(port_bindings),
            restart_policy,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            // Keep the default shell of distro images alive
            tty: Some(true),
            open_stdin: Some(true),
            ..Default::default()
        };

        let create_options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        });

        self.ensure_image(&spec.image).await?;
        let created = self.docker.create_container(create_options, config).await?;
        let container_id = created.id;
        info!(%container_id, "Container created");

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            // Leave nothing behind when the container cannot run
            if let Err(rm) = self
                .docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(%container_id, error = %rm, "Could not remove container that failed to start; orphaned");
            }
            return Err(classify(&container_id, e));
        }

        info!(%container_id, "Container started");
        Ok(container_id)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        match self
            .docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(container_id = %handle, "Container already running");
                Ok(())
            }
            Err(e) => Err(classify(handle, e)),
        }
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        let options = Some(StopContainerOptions {
            t: self.stop_timeout_secs,
        });
        match self.docker.stop_container(handle, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(container_id = %handle, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(classify(handle, e)),
        }
    }

    async fn restart(&self, handle: &str) -> Result<()> {
        self.docker
            .restart_container(handle, None)
            .await
            .map_err(|e| classify(handle, e))
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(handle, e))
    }

    async fn update_limits(&self, handle: &str, limits: &ResourceLimits) -> Result<()> {
        let options = UpdateContainerOptions::<String> {
            cpu_period: Some(vps_common::CPU_PERIOD_US),
            cpu_quota: Some(limits.cpu_quota()),
            memory: Some(limits.memory_bytes()),
            // Docker rejects a memory limit above the existing swap limit
            memory_swap: Some(limits.memory_bytes() * 2),
            ..Default::default()
        };
        self.docker
            .update_container(handle, options)
            .await
            .map_err(|e| classify(handle, e))
    }

    async fn stats(&self, handle: &str) -> Result<RawStats> {
        let mut stream = self.docker.stats(
            handle,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::MalformedStats("stats stream ended empty".into()))?
            .map_err(|e| classify(handle, e))?;
        Ok(raw_stats(&stats))
    }

    async fn exec(&self, handle: &str, cmd: &[String]) -> Result<String> {
        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions::<String> {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(handle, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Exec("exec started detached".into()));
            }
        }

        if stdout.is_empty() && !stderr.is_empty() {
            return Err(RuntimeError::Exec(
                String::from_utf8_lossy(&stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    async fn commit(&self, handle: &str, repo: &str, tag: &str) -> Result<String> {
        let options = CommitContainerOptions {
            container: handle.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            comment: format!("VPS backup of {handle}"),
            author: "vps-host".to_string(),
            pause: true, // Pause container during commit for consistency
            ..Default::default()
        };
        self.docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(|e| classify(handle, e))?;

        let image_ref = format!("{repo}:{tag}");
        info!(container_id = %handle, %image_ref, "Committed container");
        Ok(image_ref)
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerState> {
        let info = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(handle, e))?;
        let state = info.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            status: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_port() {
        assert_eq!(normalize_port("22"), "22/tcp");
        assert_eq!(normalize_port("53/udp"), "53/udp");
    }

    #[test]
    fn test_status_classification() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(classify("abc", not_found).is_not_found());

        let not_modified = BollardError::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        assert!(is_not_modified(&not_modified));
    }

    #[test]
    fn test_split_image_ref() {
        let pair = |repo: &str, tag: &str| (repo.to_string(), tag.to_string());
        assert_eq!(split_image_ref("ubuntu"), pair("ubuntu", "latest"));
        assert_eq!(split_image_ref("ubuntu:22.04"), pair("ubuntu", "22.04"));
        assert_eq!(
            split_image_ref("registry.local:5000/team/app"),
            pair("registry.local:5000/team/app", "latest")
        );
        assert_eq!(
            split_image_ref("vps-backup-vps-1:20240101_120000_000"),
            pair("vps-backup-vps-1", "20240101_120000_000")
        );
        assert_eq!(
            split_image_ref("alpine@sha256:abcd"),
            pair("alpine@sha256:abcd", "")
        );
    }
}
