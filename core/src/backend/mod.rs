//! Process Backend: the contract a session uses to obtain stdio streams
//! for its agent, regardless of whether the agent runs as a direct OS
//! process or inside a managed container (§4.1).

mod container;
mod process;

pub use container::{ContainerBackend, ContainerConfig};
pub use process::DirectProcessBackend;

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::BackendError;

/// Agent command specification: what to run and with what environment.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Explicit environment overrides, merged on top of the inherited
    /// environment (direct-process variant) or the allowlist (container
    /// variant).
    pub env: HashMap<String, String>,
}

/// Which variant produced a [`BackendHandle`]. Affects cleanup only — the
/// stdio bridge treats both identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Process,
    Container,
}

/// Internal handle used by [`BackendHandle::kill`] / [`BackendHandle::wait`]
/// to reach the underlying OS process or container.
enum Control {
    Process(tokio::process::Child),
    Container {
        docker: bollard::Docker,
        container_id: String,
    },
}

/// The streams and lifecycle handle produced by a successful [`ProcessBackend::spawn`].
pub struct BackendHandle {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub stderr: Pin<Box<dyn AsyncRead + Send>>,
    pub kind: BackendKind,
    control: Control,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// Owned stdio streams split off a [`BackendHandle`], paired with the
/// [`BackendSupervisor`] that outlives them.
pub type SplitHandle = (
    Pin<Box<dyn AsyncWrite + Send>>,
    Pin<Box<dyn AsyncRead + Send>>,
    Pin<Box<dyn AsyncRead + Send>>,
    BackendSupervisor,
);

impl BackendHandle {
    /// Split into the three stdio streams plus a [`BackendSupervisor`] that
    /// outlives them — the stdio bridge owns the streams, while a separate
    /// monitor task owns the supervisor and waits for exit (§5 "one monitor
    /// that waits for backend exit").
    pub fn split(self) -> SplitHandle {
        (
            self.stdin,
            self.stdout,
            self.stderr,
            BackendSupervisor {
                kind: self.kind,
                control: self.control,
            },
        )
    }
}

/// The lifecycle half of a [`BackendHandle`], retained after the stdio
/// streams have been handed to the bridge tasks.
pub struct BackendSupervisor {
    pub kind: BackendKind,
    control: Control,
}

impl BackendSupervisor {
    /// Tear the backend down immediately. Direct processes are killed;
    /// containers are stopped with the 10 s grace period from §5, then
    /// force-removed.
    pub async fn kill(&mut self) -> Result<(), BackendError> {
        match &mut self.control {
            Control::Process(child) => {
                child.start_kill().map_err(BackendError::Io)?;
                Ok(())
            }
            Control::Container {
                docker,
                container_id,
            } => {
                use bollard::container::{RemoveContainerOptions, StopContainerOptions};
                let _ = docker
                    .stop_container(
                        container_id,
                        Some(StopContainerOptions { t: 10 }),
                    )
                    .await;
                docker
                    .remove_container(
                        container_id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;
                Ok(())
            }
        }
    }

    /// Block until the backend exits, returning its exit code if known.
    pub async fn wait(&mut self) -> Result<Option<i32>, BackendError> {
        match &mut self.control {
            Control::Process(child) => {
                let status = child.wait().await.map_err(BackendError::Io)?;
                Ok(status.code())
            }
            Control::Container {
                docker,
                container_id,
            } => {
                use bollard::container::WaitContainerOptions;
                use futures_util::StreamExt;
                let mut stream = docker.wait_container(
                    container_id,
                    None::<WaitContainerOptions<String>>,
                );
                match stream.next().await {
                    Some(Ok(result)) => Ok(Some(result.status_code as i32)),
                    Some(Err(e)) => Err(BackendError::RuntimeUnreachable(e.to_string())),
                    None => Ok(None),
                }
            }
        }
    }
}

/// The contract every backend variant implements (§4.1).
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    async fn spawn(
        &self,
        session_id: &str,
        working_directory: &Path,
        spec: &AgentSpec,
    ) -> Result<BackendHandle, BackendError>;
}

/// Environment variable name allowlist that bridges host → agent in the
/// container variant unless explicitly set in config (§4.1 "Environment
/// hygiene").
pub const CONTAINER_ENV_ALLOWLIST: &[&str] = &["TERM", "COLORTERM", "LANG"];

pub fn is_allowlisted_env(name: &str) -> bool {
    CONTAINER_ENV_ALLOWLIST.contains(&name) || name.starts_with("LC_")
}

/// Name fragments that mark an env var as credential-bearing for the
/// "expands to empty" warning (§4.1 "Environment hygiene").
const CREDENTIAL_NAME_HINTS: &[&str] = &["KEY", "TOKEN", "SECRET", "PASSWORD", "CREDENTIAL"];

fn looks_like_credential_name(name: &str) -> bool {
    let upper = name.to_uppercase();
    CREDENTIAL_NAME_HINTS.iter().any(|hint| upper.contains(hint))
}

/// Expand `${VAR}` references in `raw` against the relay's own environment.
/// An unmatched `${` is left verbatim rather than treated as an error.
fn expand_secret_refs(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + end];
        out.push_str(&std::env::var(var_name).unwrap_or_default());
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    out
}

/// Expand every `${VAR}`-style secret reference in an [`AgentSpec`]'s
/// explicit env overrides against the relay's own environment, warning
/// when a credential-looking name expands to empty (§4.1 "Environment
/// hygiene"). Called at spawn time by each backend variant, not at config
/// load time, so the expansion always reflects the relay's current
/// environment.
pub fn expand_agent_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(name, raw)| {
            let expanded = expand_secret_refs(raw);
            if expanded.is_empty() && looks_like_credential_name(name) {
                tracing::warn!(name, "credential-looking env override expands to empty value");
            }
            (name.clone(), expanded)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_matches_documented_names() {
        assert!(is_allowlisted_env("TERM"));
        assert!(is_allowlisted_env("COLORTERM"));
        assert!(is_allowlisted_env("LANG"));
        assert!(is_allowlisted_env("LC_ALL"));
        assert!(!is_allowlisted_env("AWS_SECRET_ACCESS_KEY"));
        assert!(!is_allowlisted_env("PATH"));
    }

    #[test]
    fn expand_agent_env_substitutes_host_refs() {
        std::env::set_var("ACP_TEST_EXPAND_VAR", "hello");
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "${ACP_TEST_EXPAND_VAR} world".to_string());
        let expanded = expand_agent_env(&env);
        assert_eq!(expanded.get("GREETING"), Some(&"hello world".to_string()));
        std::env::remove_var("ACP_TEST_EXPAND_VAR");
    }

    #[test]
    fn expand_agent_env_leaves_unmatched_refs_empty_without_panicking() {
        let mut env = HashMap::new();
        env.insert("AWS_SECRET_ACCESS_KEY".to_string(), "${DEFINITELY_UNSET_VAR}".to_string());
        let expanded = expand_agent_env(&env);
        assert_eq!(expanded.get("AWS_SECRET_ACCESS_KEY"), Some(&String::new()));
    }
}
