//! Relay configuration, read entirely from environment variables (§6). No
//! file format or schema validation is in scope; every variable has a
//! default so the relay starts against a zero-config process-mode agent.

use std::collections::HashMap;
use std::path::PathBuf;

use acp_relay_core::backend::AgentSpec;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8766";
const DEFAULT_DB_PATH: &str = "acp-relay.db";
/// `cat` makes a perfectly well-behaved zero-config ACP agent for manual
/// smoke testing: anything written to its stdin comes back on stdout.
const DEFAULT_AGENT_COMMAND: &str = "cat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Process,
    Container,
}

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub image: String,
    pub runtime: Option<String>,
    pub memory_mb: Option<i64>,
    pub cpus: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub db_path: PathBuf,
    pub backend_mode: BackendMode,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    /// Explicit env overrides for the agent process, raw (unexpanded)
    /// `${VAR}` references included — expansion happens at spawn time
    /// (§4.1 "Environment hygiene").
    pub agent_env: HashMap<String, String>,
    pub container: ContainerSettings,
}

impl RelayConfig {
    /// Read configuration from environment variables.
    ///
    /// Recognized vars: `ACP_RELAY_LISTEN_ADDR`, `ACP_RELAY_DB_PATH`,
    /// `ACP_RELAY_BACKEND` (`process` | `container`), `ACP_RELAY_AGENT_COMMAND`,
    /// `ACP_RELAY_AGENT_ARGS` (whitespace-separated), `ACP_RELAY_AGENT_ENV`
    /// (comma-separated `NAME=value` pairs; `value` may reference the
    /// relay's own environment with `${VAR}`, expanded at spawn time),
    /// `ACP_RELAY_CONTAINER_IMAGE`, `ACP_RELAY_CONTAINER_RUNTIME`,
    /// `ACP_RELAY_CONTAINER_MEMORY_MB`, `ACP_RELAY_CONTAINER_CPUS`.
    pub fn from_env() -> Self {
        let listen_addr =
            std::env::var("ACP_RELAY_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());

        let db_path = std::env::var("ACP_RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));

        let backend_mode = match std::env::var("ACP_RELAY_BACKEND").as_deref() {
            Ok("container") => BackendMode::Container,
            _ => BackendMode::Process,
        };

        let agent_command =
            std::env::var("ACP_RELAY_AGENT_COMMAND").unwrap_or_else(|_| DEFAULT_AGENT_COMMAND.to_string());

        let agent_args = std::env::var("ACP_RELAY_AGENT_ARGS")
            .ok()
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let agent_env = std::env::var("ACP_RELAY_AGENT_ENV")
            .ok()
            .map(|raw| parse_agent_env(&raw))
            .unwrap_or_default();

        let container = ContainerSettings {
            image: std::env::var("ACP_RELAY_CONTAINER_IMAGE").unwrap_or_else(|_| "acp-agent:latest".into()),
            runtime: std::env::var("ACP_RELAY_CONTAINER_RUNTIME").ok(),
            memory_mb: std::env::var("ACP_RELAY_CONTAINER_MEMORY_MB")
                .ok()
                .and_then(|s| s.parse().ok()),
            cpus: std::env::var("ACP_RELAY_CONTAINER_CPUS")
                .ok()
                .and_then(|s| s.parse().ok()),
        };

        Self {
            listen_addr,
            db_path,
            backend_mode,
            agent_command,
            agent_args,
            agent_env,
            container,
        }
    }

    pub fn agent_spec(&self) -> AgentSpec {
        AgentSpec {
            command: self.agent_command.clone(),
            args: self.agent_args.clone(),
            env: self.agent_env.clone(),
        }
    }
}

/// Parse `ACP_RELAY_AGENT_ENV`: comma-separated `NAME=value` pairs. A pair
/// missing `=` or an empty name is skipped rather than treated as fatal —
/// this is operator-supplied config, not protocol input.
fn parse_agent_env(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_require_zero_configuration() {
        let config = RelayConfig {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            backend_mode: BackendMode::Process,
            agent_command: DEFAULT_AGENT_COMMAND.to_string(),
            agent_args: vec![],
            agent_env: HashMap::new(),
            container: ContainerSettings {
                image: "acp-agent:latest".into(),
                runtime: None,
                memory_mb: None,
                cpus: None,
            },
        };
        assert_eq!(config.backend_mode, BackendMode::Process);
        assert_eq!(config.agent_spec().command, "cat");
    }

    #[test]
    fn agent_args_splits_on_whitespace() {
        std::env::set_var("ACP_RELAY_AGENT_ARGS", "--foo bar --baz");
        let config = RelayConfig::from_env();
        assert_eq!(config.agent_args, vec!["--foo", "bar", "--baz"]);
        std::env::remove_var("ACP_RELAY_AGENT_ARGS");
    }

    #[test]
    fn agent_env_parses_comma_separated_pairs() {
        std::env::set_var("ACP_RELAY_AGENT_ENV", "FOO=bar, BAZ=${NONEXISTENT_HOST_VAR}");
        let config = RelayConfig::from_env();
        assert_eq!(config.agent_spec().env.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(config.agent_spec().env.get("BAZ"), Some(&"${NONEXISTENT_HOST_VAR}".to_string()));
        std::env::remove_var("ACP_RELAY_AGENT_ENV");
    }
}
