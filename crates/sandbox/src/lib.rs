//! Container-based isolated execution of model-generated code.
//!
//! `Supervisor` owns exactly one ephemeral container per `execute()` call:
//! it is created, started, awaited (with a wall-clock timeout), and removed
//! before the call returns on every exit path, including cancellation and
//! internal error. The actual daemon calls are behind the `ContainerDaemon`
//! trait so the Agent Loop's tests can script outcomes without a daemon.

mod config;
mod daemon;
mod error;

pub use config::{RuntimeSelection, SandboxConfig};
pub use daemon::{BollardDaemon, ContainerDaemon, ContainerSpec};
pub use error::SandboxError;

use std::time::Duration;

use tracing::warn;

const SECURE_RUNTIME_NAME: &str = "runsc";

/// Outcome of one sandbox invocation. Timeout and OOM are ordinary
/// outcomes here, not errors — the caller (the Agent Loop) turns them
/// into observations fed back to the model.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub duration: Duration,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.oom_killed && self.exit_code == Some(0)
    }
}

/// A bounded byte accumulator used while streaming container logs.
pub(crate) struct CappedBuffer {
    text: String,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self { text: String::new(), cap, truncated: false }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.cap.saturating_sub(self.text.len());
        if remaining == 0 {
            self.truncated = true;
            return;
        }
        let decoded = String::from_utf8_lossy(chunk);
        if decoded.len() > remaining {
            // Truncate on a UTF-8 boundary no later than `remaining`.
            let mut boundary = remaining;
            while boundary > 0 && !decoded.is_char_boundary(boundary) {
                boundary -= 1;
            }
            self.text.push_str(&decoded[..boundary]);
            self.truncated = true;
        } else {
            self.text.push_str(&decoded);
        }
    }
}

/// Drives one `ContainerDaemon` through the runtime-selection and
/// execution sequence. Generic over the daemon so production code gets
/// `Supervisor<BollardDaemon>` (aliased below as `SandboxSupervisor`)
/// while tests substitute a scripted double.
pub struct Supervisor<D: ContainerDaemon = BollardDaemon> {
    daemon: D,
}

/// The concrete supervisor production code constructs.
pub type SandboxSupervisor = Supervisor<BollardDaemon>;

impl Supervisor<BollardDaemon> {
    /// Connects to the local container daemon using its default socket.
    pub fn connect() -> Result<Self, SandboxError> {
        Ok(Self { daemon: BollardDaemon::connect()? })
    }

    #[cfg(test)]
    fn from_client(docker: bollard::Docker) -> Self {
        Self { daemon: BollardDaemon::from_client(docker) }
    }
}

impl<D: ContainerDaemon> Supervisor<D> {
    /// Wraps an already-constructed daemon, real or scripted.
    pub fn from_daemon(daemon: D) -> Self {
        Self { daemon }
    }

    /// Names of the container runtimes the daemon currently advertises.
    pub async fn available_runtimes(&self) -> Result<Vec<String>, SandboxError> {
        self.daemon.available_runtimes().await
    }

    /// Resolves the runtime selector to a concrete `--runtime` value,
    /// failing closed when a secure runtime is required but absent.
    async fn select_runtime(&self, cfg: &SandboxConfig) -> Result<Option<String>, SandboxError> {
        match cfg.runtime {
            RuntimeSelection::Standard => Ok(None),
            RuntimeSelection::Secure => {
                let runtimes = self.available_runtimes().await?;
                if runtimes.iter().any(|r| r == SECURE_RUNTIME_NAME) {
                    Ok(Some(SECURE_RUNTIME_NAME.to_string()))
                } else {
                    Err(SandboxError::SecurityViolation(
                        "secure runtime required but the daemon does not advertise one".into(),
                    ))
                }
            }
            RuntimeSelection::Auto => {
                let runtimes = self.available_runtimes().await.unwrap_or_default();
                if runtimes.iter().any(|r| r == SECURE_RUNTIME_NAME) {
                    Ok(Some(SECURE_RUNTIME_NAME.to_string()))
                } else if cfg.allow_unsafe_runtime {
                    warn!("secure runtime unavailable, falling back to the default runtime");
                    Ok(None)
                } else {
                    Err(SandboxError::SecurityViolation(
                        "no secure runtime available and allow_unsafe_runtime is false".into(),
                    ))
                }
            }
        }
    }

    /// Runs `code` in a single disposable container and returns its outcome.
    ///
    /// `context_mount` is bind-mounted read-only at `cfg.context_mount_path`
    /// when given. The container and its scratch directory are removed
    /// before this function returns, regardless of outcome.
    pub async fn execute(
        &self,
        cfg: &SandboxConfig,
        code: &str,
        context_mount: Option<&std::path::Path>,
    ) -> Result<ExecutionResult, SandboxError> {
        if cfg.network_enabled {
            warn!("sandbox execution with network access enabled");
        }

        let runtime = self.select_runtime(cfg).await?;
        self.daemon.run(ContainerSpec { cfg, code, context_mount, runtime }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_buffer_truncates_on_utf8_boundary() {
        let mut buf = CappedBuffer::new(4);
        buf.push("héllo".as_bytes());
        assert!(buf.truncated);
        assert!(String::from_utf8(buf.text.clone().into_bytes()).is_ok());
        assert!(buf.text.len() <= 4);
    }

    #[test]
    fn capped_buffer_accumulates_under_cap() {
        let mut buf = CappedBuffer::new(64);
        buf.push(b"hello ");
        buf.push(b"world");
        assert_eq!(buf.text, "hello world");
        assert!(!buf.truncated);
    }

    #[test]
    fn connecting_a_client_does_not_touch_the_daemon() {
        let docker = bollard::Docker::connect_with_local_defaults().expect("local defaults never dial the socket");
        let _supervisor = Supervisor::from_client(docker);
    }
}
