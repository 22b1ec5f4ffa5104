//! Direct-process variant of the Process Backend (§4.1).

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{expand_agent_env, AgentSpec, BackendHandle, BackendKind, Control, ProcessBackend};
use crate::errors::BackendError;

/// Spawns the agent as a plain child process, inheriting the relay's
/// environment plus explicit overrides and `PWD=working_directory`.
pub struct DirectProcessBackend;

impl DirectProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DirectProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessBackend for DirectProcessBackend {
    async fn spawn(
        &self,
        session_id: &str,
        working_directory: &Path,
        spec: &AgentSpec,
    ) -> Result<BackendHandle, BackendError> {
        let env = expand_agent_env(&spec.env);
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .current_dir(working_directory)
            .env("PWD", working_directory)
            .envs(&env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::BinaryNotFound(spec.command.clone())
            } else {
                BackendError::Io(e)
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::AttachFailed("missing stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::AttachFailed("missing stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::AttachFailed("missing stderr".into()))?;

        info!(session_id, command = %spec.command, pid = ?child.id(), "spawned agent process");

        Ok(BackendHandle {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            kind: BackendKind::Process,
            control: Control::Process(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn spawns_and_echoes_a_line() {
        let backend = DirectProcessBackend::new();
        let dir = tempdir().unwrap();
        let spec = AgentSpec {
            command: "cat".into(),
            args: vec![],
            env: HashMap::new(),
        };
        let handle = backend.spawn("sess_test", dir.path(), &spec).await.unwrap();
        let (mut stdin, mut stdout, _stderr, mut supervisor) = handle.split();
        stdin.write_all(b"hello\n").await.unwrap();
        stdin.flush().await.unwrap();
        drop(stdin);

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello\n");

        supervisor.wait().await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_a_typed_error() {
        let backend = DirectProcessBackend::new();
        let dir = tempdir().unwrap();
        let spec = AgentSpec {
            command: "definitely-not-a-real-binary-xyz".into(),
            args: vec![],
            env: HashMap::new(),
        };
        let err = backend.spawn("sess_test", dir.path(), &spec).await.unwrap_err();
        assert!(matches!(err, BackendError::BinaryNotFound(_)));
    }
}
