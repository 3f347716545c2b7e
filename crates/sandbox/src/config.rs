use std::str::FromStr;
use std::time::Duration;

/// Runtime selection policy (spec §4.1 "Runtime selection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSelection {
    /// Prefer a user-space-kernel runtime; fall back per `allow_unsafe_runtime`.
    Auto,
    /// Require a user-space-kernel runtime; refuse otherwise.
    Secure,
    /// Always use the daemon's default runtime.
    Standard,
}

impl FromStr for RuntimeSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "secure" => Ok(Self::Secure),
            "standard" => Ok(Self::Standard),
            other => Err(format!("unknown runtime selector: {other}")),
        }
    }
}

/// Configuration for one `SandboxSupervisor::execute` call.
///
/// Defaults mirror the table in spec §6. The open question on default
/// memory ceiling (256 MiB vs 512 MiB) is resolved here in favor of the
/// smaller value, matching the more conservative of the two revisions.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub runtime: RuntimeSelection,
    pub allow_unsafe_runtime: bool,
    pub memory_mb: i64,
    pub cpu_cores: f64,
    pub pids_limit: i64,
    pub execution_timeout: Duration,
    pub network_enabled: bool,
    /// Safety bound on bytes buffered from the container's stdout stream,
    /// independent of the Egress Filter's own truncation threshold.
    pub stdout_byte_cap: usize,
    pub stderr_byte_cap: usize,
    /// Fixed in-container path an optional context file is mounted at.
    pub context_mount_path: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".to_string(),
            runtime: RuntimeSelection::Auto,
            allow_unsafe_runtime: false,
            memory_mb: 256,
            cpu_cores: 0.5,
            pids_limit: 50,
            execution_timeout: Duration::from_secs(30),
            network_enabled: false,
            stdout_byte_cap: 1 << 20,
            stderr_byte_cap: 1 << 20,
            context_mount_path: "/context/context.txt".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_runtime_selectors() {
        assert_eq!(RuntimeSelection::from_str("secure").unwrap(), RuntimeSelection::Secure);
        assert_eq!(RuntimeSelection::from_str("AUTO").unwrap(), RuntimeSelection::Auto);
        assert!(RuntimeSelection::from_str("bogus").is_err());
    }

    #[test]
    fn defaults_match_spec_table() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.image, "python:3.11-slim");
        assert_eq!(cfg.memory_mb, 256);
        assert_eq!(cfg.pids_limit, 50);
        assert_eq!(cfg.execution_timeout, Duration::from_secs(30));
        assert!(!cfg.network_enabled);
        assert!(!cfg.allow_unsafe_runtime);
    }
}
