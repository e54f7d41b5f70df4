//! Environment-driven service configuration.
//!
//! All configuration crosses the process boundary as environment variables
//! (optionally via a `.env` file). Secrets are held behind `secrecy` so
//! they never land in logs or debug output.

use std::env;
use std::str::FromStr;

use secrecy::Secret;
use tracing::warn;

use trafficcontrol_types::{CapacityLimits, Model, OrchestratorConfig};

/// Which agent-runtime adapter variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// In-process SDK client.
    Sdk,
    /// Relay CLI subprocess.
    Cli,
}

impl FromStr for AgentMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sdk" => Ok(AgentMode::Sdk),
            "cli" => Ok(AgentMode::Cli),
            other => Err(ConfigError::Invalid(format!(
                "AGENT_MODE must be sdk or cli, got {other:?}"
            ))),
        }
    }
}

/// Configuration errors; all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    /// A variable is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full service configuration as loaded from the environment.
pub struct ServiceConfig {
    /// Database endpoint, handed to the external store driver.
    pub database_url: Option<Secret<String>>,
    /// Database service key.
    pub database_service_key: Option<Secret<String>>,
    /// Chat bot token; absent means the in-memory transport.
    pub chat_token: Option<Secret<String>>,
    /// Channel the orchestrator talks in.
    pub chat_channel_id: String,
    /// Adapter variant.
    pub agent_mode: AgentMode,
    /// Whether the health/status HTTP endpoints are served.
    pub dashboard_enabled: bool,
    /// Port for the HTTP endpoints.
    pub dashboard_port: u16,
    /// Path of the relay CLI binary.
    pub relay_cli_path: String,
    /// Per-query timeout for the relay, milliseconds.
    pub relay_timeout_ms: u64,
    /// Model override forced onto every query, if set.
    pub relay_model: Option<Model>,
    /// Path accumulated learnings are written to.
    pub learnings_path: Option<String>,
    /// Log filter, `tracing_subscriber::EnvFilter` syntax.
    pub log_level: String,
    /// Main-loop configuration.
    pub orchestrator: OrchestratorConfig,
}

impl ServiceConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let chat_channel_id = env::var("CHAT_CHANNEL_ID").unwrap_or_default();
        let chat_token = secret_var("CHAT_TOKEN");
        if chat_token.is_some() && chat_channel_id.is_empty() {
            return Err(ConfigError::Missing("CHAT_CHANNEL_ID"));
        }

        let mut orchestrator = OrchestratorConfig::default();
        if let Some(interval) = parsed_var::<u64>("TC_POLL_INTERVAL_MS")? {
            orchestrator.poll_interval_ms = interval;
        }
        if let Some(max_agents) = parsed_var::<usize>("TC_MAX_CONCURRENT_AGENTS")? {
            orchestrator.capacity = clamp_capacity(orchestrator.capacity, max_agents);
        }
        if let Some(path) = env::var("TC_STATE_FILE_PATH").ok().filter(|p| !p.is_empty()) {
            orchestrator.state_file_path = path;
        }

        Ok(Self {
            database_url: secret_var("DATABASE_URL"),
            database_service_key: secret_var("DATABASE_SERVICE_KEY"),
            chat_token,
            chat_channel_id,
            agent_mode: env::var("AGENT_MODE")
                .unwrap_or_else(|_| "cli".to_string())
                .parse()?,
            dashboard_enabled: flag_var("DASHBOARD_ENABLED", false),
            dashboard_port: parsed_var::<u16>("DASHBOARD_PORT")?.unwrap_or(8080),
            relay_cli_path: env::var("RELAY_CLI_PATH").unwrap_or_else(|_| "claude".to_string()),
            relay_timeout_ms: parsed_var::<u64>("RELAY_TIMEOUT_MS")?.unwrap_or(600_000),
            relay_model: match env::var("RELAY_MODEL") {
                Ok(raw) if !raw.trim().is_empty() => Some(
                    raw.parse::<Model>()
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?,
                ),
                _ => None,
            },
            learnings_path: env::var("TC_LEARNINGS_PATH").ok().filter(|p| !p.is_empty()),
            log_level: env::var("TC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            orchestrator,
        })
    }
}

/// Cap the default per-model limits so their total stays within
/// `max_agents`, shedding haiku first, then sonnet, then opus.
fn clamp_capacity(mut limits: CapacityLimits, max_agents: usize) -> CapacityLimits {
    if max_agents == 0 {
        warn!("TC_MAX_CONCURRENT_AGENTS=0 would disable scheduling, keeping defaults");
        return limits;
    }
    while limits.total() > max_agents {
        if limits.haiku > 0 {
            limits.haiku -= 1;
        } else if limits.sonnet > 0 {
            limits.sonnet -= 1;
        } else if limits.opus > 1 {
            limits.opus -= 1;
        } else {
            break;
        }
    }
    limits
}

fn secret_var(name: &str) -> Option<Secret<String>> {
    env::var(name).ok().filter(|v| !v.is_empty()).map(Secret::new)
}

fn flag_var(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn parsed_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} is not a valid value: {raw:?}"))),
        _ => Ok(None),
    }
}
