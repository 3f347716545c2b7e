//! Loads `Settings` from environment variables under the `WARDEN_`
//! prefix, with an opportunistic `.env` read before the environment is
//! consulted. An invalid value is a boot-time `ConfigError`, never a
//! silent fallback or a panic.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::info;
use warden_sandbox::RuntimeSelection;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for WARDEN_{key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Fully resolved configuration for one Agent Loop run, threaded into
/// every component at construction time. No ambient mutable state.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sandbox: warden_sandbox::SandboxConfig,
    pub egress: warden_egress::EgressConfig,
    pub llm_provider: String,
    pub llm_model: String,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub max_iterations: u32,
    pub max_budget_dollars: f64,
    pub pricing_path: Option<PathBuf>,
    pub transcript_path: Option<PathBuf>,
}

impl Settings {
    /// Loads `.env` (if present) then reads `WARDEN_*` environment
    /// variables, falling back to the defaults in spec §6 for anything
    /// unset.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let runtime_raw = env_string("RUNTIME", "auto");
        let runtime = RuntimeSelection::from_str(&runtime_raw)
            .map_err(|_| ConfigError::InvalidValue { key: "RUNTIME".to_string(), value: runtime_raw })?;

        let sandbox = warden_sandbox::SandboxConfig {
            image: env_string("CONTAINER_IMAGE", "python:3.11-slim"),
            runtime,
            allow_unsafe_runtime: env_bool("ALLOW_UNSAFE_RUNTIME", false)?,
            memory_mb: parse_memory_mb(&env_string("MEMORY_LIMIT", "256m"))?,
            cpu_cores: env_parsed("CPU_LIMIT", 0.5)?,
            pids_limit: env_parsed("PIDS_LIMIT", 50)?,
            execution_timeout: Duration::from_secs(env_parsed::<u64>("EXECUTION_TIMEOUT", 30)?),
            network_enabled: env_bool("NETWORK_ENABLED", false)?,
            ..warden_sandbox::SandboxConfig::default()
        };

        let egress = warden_egress::EgressConfig {
            max_stdout_bytes: env_parsed("MAX_STDOUT_BYTES", 4000)?,
            min_entropy_length: env_parsed("MIN_ENTROPY_LENGTH", 20)?,
            entropy_threshold: env_parsed("ENTROPY_THRESHOLD", 4.5)?,
            similarity_threshold: env_parsed("SIMILARITY_THRESHOLD", 0.8)?,
            raise_on_leak: env_bool("RAISE_ON_LEAK", false)?,
        };

        let settings = Settings {
            sandbox,
            egress,
            llm_provider: env_string("LLM_PROVIDER", "openai"),
            llm_model: env_string("LLM_MODEL", "gpt-4o-mini"),
            llm_base_url: env_string("LLM_BASE_URL", "https://api.openai.com/v1"),
            llm_api_key: std::env::var("WARDEN_LLM_API_KEY").ok(),
            max_iterations: env_parsed("MAX_ITERATIONS", 10)?,
            max_budget_dollars: env_parsed("MAX_BUDGET_DOLLARS", 1.0)?,
            pricing_path: std::env::var("WARDEN_PRICING_PATH").ok().map(PathBuf::from),
            transcript_path: std::env::var("WARDEN_TRANSCRIPT_PATH").ok().map(PathBuf::from),
        };

        info!(
            image = %settings.sandbox.image,
            runtime = ?settings.sandbox.runtime,
            max_iterations = settings.max_iterations,
            "settings loaded"
        );
        Ok(settings)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(format!("WARDEN_{key}")).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(format!("WARDEN_{key}")) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "false" | "FALSE" | "False" => Ok(false),
            other => Err(ConfigError::InvalidValue { key: key.to_string(), value: other.to_string() }),
        },
        Err(_) => Ok(default),
    }
}

fn env_parsed<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match std::env::var(format!("WARDEN_{key}")) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_memory_mb(raw: &str) -> Result<i64, ConfigError> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let (digits, multiplier) = if let Some(stripped) = lower.strip_suffix('g') {
        (stripped, 1024)
    } else if let Some(stripped) = lower.strip_suffix('m') {
        (stripped, 1)
    } else {
        (lower.as_str(), 1)
    };
    digits
        .parse::<i64>()
        .map(|v| v * multiplier)
        .map_err(|_| ConfigError::InvalidValue { key: "MEMORY_LIMIT".to_string(), value: trimmed.to_string() })
}
