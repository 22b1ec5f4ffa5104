//! Container variant of the Process Backend (§4.1), using `bollard` for
//! async Docker API access instead of shelling out to the CLI.
//!
//! Container runtimes frame stdout and stderr on a single stream when no
//! TTY is allocated; this module demultiplexes that stream into two
//! independent `AsyncRead`s so the rest of the relay never has to know
//! the backend was a container (§9 "Container stdio demultiplexing").

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{info, warn};

use super::{expand_agent_env, is_allowlisted_env, AgentSpec, BackendHandle, BackendKind, Control, ProcessBackend};
use crate::errors::BackendError;

/// Label applied to every container the relay manages, used to find or
/// recreate a session's container across relay restarts (§4.1).
const MANAGED_BY_LABEL: &str = "managed-by";
const MANAGED_BY_VALUE: &str = "acp-relay";
const SESSION_LABEL: &str = "session-id";

/// Container runtime configuration: image, resource limits and mounts.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    /// Unix socket path for a non-default Docker daemon (e.g. `podman`'s
    /// compatibility socket). `None` connects to the local default.
    pub runtime_socket: Option<String>,
    pub memory_mb: Option<i64>,
    pub cpus: Option<f64>,
    /// Host path mounted read-write at `/workspace` inside the container.
    pub workspace_mount: Option<String>,
}

pub struct ContainerBackend {
    docker: Docker,
    config: ContainerConfig,
}

impl ContainerBackend {
    pub fn connect(config: ContainerConfig) -> Result<Self, BackendError> {
        let docker = match &config.runtime_socket {
            Some(socket) => Docker::connect_with_unix(socket, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;
        Ok(Self { docker, config })
    }

    async fn ensure_image(&self) -> Result<(), BackendError> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }
        info!(image = %self.config.image, "pulling agent image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;
        }
        Ok(())
    }

    /// Find an existing labeled container for this session, reusing it if
    /// running and recreating it if stopped (§4.1).
    async fn find_or_create_container(
        &self,
        session_id: &str,
        working_directory: &Path,
        spec: &AgentSpec,
    ) -> Result<String, BackendError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{SESSION_LABEL}={session_id}")],
        );
        let existing = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;

        if let Some(summary) = existing.into_iter().next() {
            let id = summary.id.ok_or_else(|| {
                BackendError::RuntimeUnreachable("container summary missing id".into())
            })?;
            let running = summary.state.as_deref() == Some("running");
            if running {
                info!(session_id, container_id = %id, "reattaching to running container");
                return Ok(id);
            }
            info!(session_id, container_id = %id, "removing stopped container before recreate");
            self.docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;
        }

        self.create_container(session_id, working_directory, spec).await
    }

    async fn create_container(
        &self,
        session_id: &str,
        working_directory: &Path,
        spec: &AgentSpec,
    ) -> Result<String, BackendError> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());

        let mut env: Vec<String> = std::env::vars()
            .filter(|(k, _)| is_allowlisted_env(k))
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for (name, value) in expand_agent_env(&spec.env) {
            env.push(format!("{name}={value}"));
        }

        let mut binds = Vec::new();
        if let Some(mount) = &self.config.workspace_mount {
            binds.push(format!("{mount}:/workspace:rw"));
        } else {
            binds.push(format!("{}:/workspace:rw", working_directory.display()));
        }

        let host_config = HostConfig {
            binds: Some(binds),
            memory: self.config.memory_mb.map(|mb| mb * 1024 * 1024),
            nano_cpus: self.config.cpus.map(|c| (c * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let mut command = vec![spec.command.clone()];
        command.extend(spec.args.iter().cloned());

        let config = Config {
            image: Some(self.config.image.clone()),
            cmd: Some(command),
            env: Some(env),
            working_dir: Some("/workspace".to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let name = format!("acp-relay-{session_id}");
        let created = self
            .docker
            .create_container(Some(CreateContainerOptions { name, platform: None }), config)
            .await
            .map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;

        Ok(created.id)
    }
}

#[async_trait]
impl ProcessBackend for ContainerBackend {
    async fn spawn(
        &self,
        session_id: &str,
        working_directory: &Path,
        spec: &AgentSpec,
    ) -> Result<BackendHandle, BackendError> {
        self.ensure_image().await?;
        let container_id = self
            .find_or_create_container(session_id, working_directory, spec)
            .await?;

        // Confirm the runtime considers the container healthy before attaching.
        self.docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| BackendError::AttachFailed(e.to_string()))?;

        let attach = self
            .docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| BackendError::AttachFailed(e.to_string()))?;

        let (stdout_read, stdout_write) = tokio::io::duplex(64 * 1024);
        let (stderr_read, stderr_write) = tokio::io::duplex(64 * 1024);
        demultiplex(attach.output, stdout_write, stderr_write);

        info!(session_id, container_id = %container_id, "attached to container agent");

        Ok(BackendHandle {
            stdin: Box::pin(attach.input),
            stdout: Box::pin(stdout_read),
            stderr: Box::pin(stderr_read),
            kind: BackendKind::Container,
            control: Control::Container {
                docker: self.docker.clone(),
                container_id,
            },
        })
    }
}

/// Spawn a task that reads a multiplexed `bollard` log stream and forwards
/// each frame's payload to the matching duplex half.
fn demultiplex(
    mut output: impl futures_util::Stream<Item = Result<LogOutput, bollard::errors::Error>>
        + Unpin
        + Send
        + 'static,
    mut stdout_write: tokio::io::DuplexStream,
    mut stderr_write: tokio::io::DuplexStream,
) {
    use tokio::io::AsyncWriteExt;
    tokio::spawn(async move {
        while let Some(frame) = output.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("container attach stream error: {e}");
                    break;
                }
            };
            let (sink, bytes) = match frame {
                LogOutput::StdOut { message } => (&mut stdout_write, message),
                LogOutput::Console { message } => (&mut stdout_write, message),
                LogOutput::StdErr { message } => (&mut stderr_write, message),
                LogOutput::StdIn { .. } => continue,
            };
            if sink.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_label_roundtrips_into_filter() {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{SESSION_LABEL}=sess_abc")],
        );
        assert_eq!(filters["label"][0], "session-id=sess_abc");
    }
}
