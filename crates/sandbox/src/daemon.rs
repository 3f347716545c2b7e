//! The narrow seam between `Supervisor` and the container runtime it talks
//! to. `BollardDaemon` is the real implementation, backed by the local
//! Docker-compatible socket; tests substitute a scripted double instead of
//! standing up a daemon.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio::time::timeout as with_timeout;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::{CappedBuffer, ExecutionResult};

const STOP_GRACE_SECS: i64 = 5;

/// The per-call parameters a daemon needs to run one container to
/// completion. Everything that varies call-to-call; policy that's fixed
/// for the supervisor's lifetime lives on `SandboxConfig`.
pub struct ContainerSpec<'a> {
    pub cfg: &'a SandboxConfig,
    pub code: &'a str,
    pub context_mount: Option<&'a Path>,
    pub runtime: Option<String>,
}

/// Abstraction over "a thing that can list runtimes and run one disposable
/// container to completion". `Supervisor<D>` is generic over this so the
/// Agent Loop's tests can script end-to-end scenarios (OOM, timeout,
/// a missing secure runtime, budget interplay) without a real daemon.
#[async_trait]
pub trait ContainerDaemon: Send + Sync {
    async fn available_runtimes(&self) -> Result<Vec<String>, SandboxError>;
    async fn run(&self, spec: ContainerSpec<'_>) -> Result<ExecutionResult, SandboxError>;
}

/// `ContainerDaemon` backed by a real Docker-compatible daemon over its
/// local socket.
pub struct BollardDaemon {
    docker: Docker,
}

impl BollardDaemon {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Daemon(e.to_string()))?;
        Ok(Self { docker })
    }

    #[cfg(test)]
    pub(crate) fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn run_container(
        &self,
        name: &str,
        cfg: &SandboxConfig,
    ) -> Result<ExecutionResult, SandboxError> {
        let start = Instant::now();

        self.docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;

        let mut stdout = CappedBuffer::new(cfg.stdout_byte_cap);
        let mut stderr = CappedBuffer::new(cfg.stderr_byte_cap);

        let wait = self.wait_for_exit(name);
        let logs = self.stream_logs(name, &mut stdout, &mut stderr);

        let wait_result = match with_timeout(cfg.execution_timeout, async {
            let (wait_res, _) = tokio::join!(wait, logs);
            wait_res
        })
        .await
        {
            Ok(wait_res) => wait_res,
            Err(_) => {
                info!(container = %name, "sandbox execution timed out, stopping container");
                let _ = self
                    .docker
                    .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                    .await;
                return Ok(ExecutionResult {
                    stdout: stdout.text,
                    stderr: stderr.text,
                    exit_code: None,
                    timed_out: true,
                    oom_killed: false,
                    duration: start.elapsed(),
                    stdout_truncated: stdout.truncated,
                    stderr_truncated: stderr.truncated,
                });
            }
        };

        let inspection = self
            .docker
            .inspect_container(name, None)
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?;
        let state = inspection.state.unwrap_or_default();
        let oom_killed = state.oom_killed.unwrap_or(false);
        let exit_code = state.exit_code.or(wait_result);

        Ok(ExecutionResult {
            stdout: stdout.text,
            stderr: stderr.text,
            exit_code,
            timed_out: false,
            oom_killed,
            duration: start.elapsed(),
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
        })
    }

    async fn wait_for_exit(&self, name: &str) -> Option<i64> {
        let mut stream = self
            .docker
            .wait_container(name, Some(WaitContainerOptions { condition: "not-running" }));
        match stream.next().await {
            Some(Ok(res)) => Some(res.status_code),
            Some(Err(_)) => None,
            None => None,
        }
    }

    async fn stream_logs(&self, name: &str, stdout: &mut CappedBuffer, stderr: &mut CappedBuffer) {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> { follow: true, stdout: true, stderr: true, ..Default::default() }),
        );
        while let Some(chunk) = stream.next().await {
            let Ok(log) = chunk else { break };
            match log {
                LogOutput::StdOut { message } => stdout.push(&message),
                LogOutput::StdErr { message } => stderr.push(&message),
                LogOutput::Console { message } => stdout.push(&message),
                LogOutput::StdIn { .. } => {}
            }
            if stdout.truncated && stderr.truncated {
                break;
            }
        }
    }
}

#[async_trait]
impl ContainerDaemon for BollardDaemon {
    async fn available_runtimes(&self) -> Result<Vec<String>, SandboxError> {
        let info = self.docker.info().await.map_err(|e| SandboxError::Daemon(e.to_string()))?;
        Ok(info.runtimes.map(|runtimes| runtimes.into_keys().collect()).unwrap_or_default())
    }

    async fn run(&self, spec: ContainerSpec<'_>) -> Result<ExecutionResult, SandboxError> {
        let scratch = tempfile::tempdir().map_err(|e| SandboxError::Internal(e.to_string()))?;
        let code_path = scratch.path().join("main.py");
        std::fs::write(&code_path, spec.code).map_err(|e| SandboxError::Internal(e.to_string()))?;

        let name = format!("warden-sandbox-{}", uuid::Uuid::new_v4());
        let container_config =
            build_container_config(scratch.path(), spec.context_mount, spec.cfg, spec.runtime)?;

        debug!(container = %name, image = %spec.cfg.image, "creating sandbox container");
        self.docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), container_config)
            .await
            .map_err(classify_create_error)?;

        let result = self.run_container(&name, spec.cfg).await;

        // Guaranteed release: the container is force-removed on every
        // path, including when `run_container` itself errored.
        let remove_opts = RemoveContainerOptions { force: true, v: true, ..Default::default() };
        if let Err(e) = self.docker.remove_container(&name, Some(remove_opts)).await {
            warn!(container = %name, error = %e, "failed to remove sandbox container");
        }
        // `scratch` is dropped here, releasing the host-side temp directory
        // regardless of how `run_container` returned.

        result
    }
}

fn classify_create_error(err: bollard::errors::Error) -> SandboxError {
    match &err {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
            SandboxError::Image(err.to_string())
        }
        _ => SandboxError::Internal(err.to_string()),
    }
}

fn build_container_config(
    scratch_dir: &Path,
    context_mount: Option<&Path>,
    cfg: &SandboxConfig,
    runtime: Option<String>,
) -> Result<ContainerConfig<String>, SandboxError> {
    let memory_bytes = cfg.memory_mb.saturating_mul(1024).saturating_mul(1024);
    let nano_cpus = f64_to_nano_cpus(cfg.cpu_cores)?;

    let mut binds = vec![format!("{}:/workspace:ro", scratch_dir.display())];
    if let Some(context_path) = context_mount {
        binds.push(format!("{}:{}:ro", context_path.display(), cfg.context_mount_path));
    }

    let mut tmpfs: HashMap<String, String> = HashMap::new();
    tmpfs.insert("/tmp".to_string(), "rw,size=64m".to_string());

    let host_config = HostConfig {
        network_mode: Some(if cfg.network_enabled { "bridge" } else { "none" }.to_string()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        ipc_mode: Some("none".to_string()),
        pids_limit: Some(cfg.pids_limit),
        memory: Some(memory_bytes),
        memory_swap: Some(memory_bytes),
        nano_cpus: Some(nano_cpus),
        runtime,
        binds: Some(binds),
        tmpfs: Some(tmpfs),
        ..Default::default()
    };

    Ok(ContainerConfig {
        image: Some(cfg.image.clone()),
        cmd: Some(vec!["python3".to_string(), "/workspace/main.py".to_string()]),
        working_dir: Some("/workspace".to_string()),
        host_config: Some(host_config),
        network_disabled: Some(!cfg.network_enabled),
        ..Default::default()
    })
}

fn f64_to_nano_cpus(cores: f64) -> Result<i64, SandboxError> {
    if !cores.is_finite() || cores <= 0.0 {
        return Err(SandboxError::Internal(format!("invalid cpu_cores: {cores}")));
    }
    Ok((cores * 1_000_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nano_cpu_conversion_rejects_nonpositive() {
        assert!(f64_to_nano_cpus(0.0).is_err());
        assert!(f64_to_nano_cpus(-1.0).is_err());
        assert_eq!(f64_to_nano_cpus(0.5).unwrap(), 500_000_000);
    }

    #[test]
    fn build_container_config_denies_network_by_default() {
        let cfg = SandboxConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let container = build_container_config(dir.path(), None, &cfg, None).unwrap();
        let host = container.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.memory, host.memory_swap);
    }
}
