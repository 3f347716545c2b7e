use thiserror::Error;

/// Failure taxonomy for the Sandbox Supervisor.
///
/// `Timeout` and OOM are deliberately absent: both are normal
/// `ExecutionResult` outcomes, not errors (spec §7).
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("container daemon unreachable: {0}")]
    Daemon(String),

    #[error("image unavailable: {0}")]
    Image(String),

    #[error("runtime not found: {0}")]
    Runtime(String),

    #[error("internal sandbox error: {0}")]
    Internal(String),
}
