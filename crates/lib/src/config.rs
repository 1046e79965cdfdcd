//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.autopilot/config.json`) and environment.
//! Every timing constant of the orchestrator lives here with its production default.

use crate::store::{CredentialMode, SessionContext};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP control surface.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Store / processing backend connection.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Orchestrator behaviour and timings.
    #[serde(default)]
    pub autopilot: AutopilotConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP control surface (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Allow binding to a non-loopback address. The gateway has no auth of its own.
    #[serde(default)]
    pub allow_remote: bool,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            allow_remote: false,
        }
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Where messages and processing status come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// REST base URL. Overridden by AUTOPILOT_BACKEND_URL env.
    pub base_url: Option<String>,
    /// Bearer token. Overridden by AUTOPILOT_BACKEND_TOKEN env.
    pub token: Option<String>,
    /// "admin" or "tenant" credential context for discovery.
    #[serde(default)]
    pub mode: CredentialMode,
    /// Tenant id sent in tenant mode.
    pub tenant_id: Option<String>,
}

impl BackendConfig {
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            mode: self.mode,
            tenant_id: match self.mode {
                CredentialMode::Admin => None,
                CredentialMode::Tenant => self.tenant_id.clone(),
            },
        }
    }
}

/// How discovered messages are submitted for processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One message at a time.
    #[default]
    Sequential,
    /// Same-contact messages that arrive together go out as one request.
    Batch,
    /// Up to `parallelLimit` messages processed independently.
    Parallel,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" | "single" => Ok(Strategy::Sequential),
            "batch" => Ok(Strategy::Batch),
            "parallel" => Ok(Strategy::Parallel),
            other => Err(format!(
                "unknown strategy \"{}\" (expected sequential, batch or parallel)",
                other
            )),
        }
    }
}

/// Orchestrator timings and limits. Durations are milliseconds on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutopilotConfig {
    pub strategy: Strategy,
    /// Activate on startup (after a successful health check).
    pub start_active: bool,
    pub discovery_interval_ms: u64,
    /// Poll interval for single and parallel processing.
    pub poll_interval_ms: u64,
    pub batch_poll_interval_ms: u64,
    /// Ceiling on time spent in a non-terminal state.
    pub processing_timeout_ms: u64,
    /// Wall-clock ceiling for a batch before falling back to individual processing.
    pub batch_ceiling_ms: u64,
    /// Consecutive empty batch polls before falling back.
    pub batch_max_empty_polls: u32,
    pub max_batch_size: usize,
    pub parallel_limit: usize,
    pub safety_interval_ms: u64,
    /// Delay before an errored message is removed from the visible list.
    pub error_cleanup_delay_ms: u64,
    /// Joins batch member contents into one request body.
    pub batch_separator: String,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Sequential,
            start_active: false,
            discovery_interval_ms: 5_000,
            poll_interval_ms: 2_000,
            batch_poll_interval_ms: 1_000,
            processing_timeout_ms: 120_000,
            batch_ceiling_ms: 30_000,
            batch_max_empty_polls: 5,
            max_batch_size: 10,
            parallel_limit: 3,
            safety_interval_ms: 15_000,
            error_cleanup_delay_ms: 10_000,
            batch_separator: "\n\n".to_string(),
        }
    }
}

impl AutopilotConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn batch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.batch_poll_interval_ms.max(1))
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn batch_ceiling(&self) -> Duration {
        Duration::from_millis(self.batch_ceiling_ms)
    }

    pub fn safety_interval(&self) -> Duration {
        Duration::from_millis(self.safety_interval_ms.max(1))
    }

    pub fn error_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.error_cleanup_delay_ms)
    }

    /// At least one slot.
    pub fn parallel_limit(&self) -> usize {
        self.parallel_limit.max(1)
    }

    /// Batches need at least two members to be worth it.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.max(2)
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the backend base URL: env AUTOPILOT_BACKEND_URL overrides config.
pub fn resolve_backend_url(config: &Config) -> Option<String> {
    env_override("AUTOPILOT_BACKEND_URL").or_else(|| trimmed(config.backend.base_url.as_ref()))
}

/// Resolve the backend token: env AUTOPILOT_BACKEND_TOKEN overrides config.
pub fn resolve_backend_token(config: &Config) -> Option<String> {
    env_override("AUTOPILOT_BACKEND_TOKEN").or_else(|| trimmed(config.backend.token.as_ref()))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("AUTOPILOT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".autopilot").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 15152);
        assert_eq!(g.bind, "127.0.0.1");
        assert!(!g.allow_remote);
    }

    #[test]
    fn autopilot_defaults_match_documented_constants() {
        let a = AutopilotConfig::default();
        assert_eq!(a.poll_interval(), Duration::from_secs(2));
        assert_eq!(a.batch_poll_interval(), Duration::from_secs(1));
        assert_eq!(a.processing_timeout(), Duration::from_secs(120));
        assert_eq!(a.batch_ceiling(), Duration::from_secs(30));
        assert_eq!(a.batch_max_empty_polls, 5);
        assert_eq!(a.parallel_limit(), 3);
        assert_eq!(a.safety_interval(), Duration::from_secs(15));
        assert_eq!(a.strategy, Strategy::Sequential);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c: Config = serde_json::from_str(
            r#"{"autopilot":{"strategy":"batch","pollIntervalMs":500},"backend":{"mode":"admin"}}"#,
        )
        .unwrap();
        assert_eq!(c.autopilot.strategy, Strategy::Batch);
        assert_eq!(c.autopilot.poll_interval_ms, 500);
        assert_eq!(c.autopilot.batch_ceiling_ms, 30_000);
        assert_eq!(c.backend.mode, CredentialMode::Admin);
        assert_eq!(c.gateway.port, 15152);
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Parallel".parse::<Strategy>(), Ok(Strategy::Parallel));
        assert_eq!("single".parse::<Strategy>(), Ok(Strategy::Sequential));
        assert!("fast".parse::<Strategy>().is_err());
    }

    #[test]
    fn admin_context_drops_tenant() {
        let b = BackendConfig {
            mode: CredentialMode::Admin,
            tenant_id: Some("t1".into()),
            ..Default::default()
        };
        assert_eq!(b.session_context(), SessionContext::admin());
        let t = BackendConfig {
            mode: CredentialMode::Tenant,
            tenant_id: Some("t1".into()),
            ..Default::default()
        };
        assert_eq!(t.session_context(), SessionContext::tenant("t1"));
    }

    #[test]
    fn limits_are_clamped() {
        let a = AutopilotConfig {
            parallel_limit: 0,
            max_batch_size: 1,
            ..Default::default()
        };
        assert_eq!(a.parallel_limit(), 1);
        assert_eq!(a.max_batch_size(), 2);
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("autopilot-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.autopilot.discovery_interval_ms, 5_000);
    }
}
