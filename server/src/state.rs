//! Shared application state handed to every Axum handler: the one
//! process-wide [`SessionManager`] plus the agent spec new sessions are
//! created with.

use std::collections::HashMap;
use std::sync::Arc;

use acp_relay_core::backend::{AgentSpec, ContainerBackend, ContainerConfig, DirectProcessBackend, ProcessBackend};
use acp_relay_core::SessionManager;
use tokio::sync::Mutex;

use crate::config::{BackendMode, RelayConfig};
use crate::http::HttpPollTransport;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub default_agent_spec: AgentSpec,
    /// One synthetic polling-buffer client per session created over HTTP
    /// (§4.5, §9). Populated by `POST /session/new`, read by `POST /session/prompt`.
    pub http_transports: Arc<Mutex<HashMap<String, Arc<HttpPollTransport>>>>,
}

impl AppState {
    pub fn new(config: &RelayConfig, log: acp_relay_core::MessageLog) -> anyhow::Result<Self> {
        let backend: Arc<dyn ProcessBackend> = match config.backend_mode {
            BackendMode::Process => Arc::new(DirectProcessBackend::new()),
            BackendMode::Container => Arc::new(ContainerBackend::connect(ContainerConfig {
                image: config.container.image.clone(),
                runtime_socket: config.container.runtime.clone(),
                memory_mb: config.container.memory_mb,
                cpus: config.container.cpus,
                workspace_mount: None,
            })?),
        };

        Ok(Self {
            sessions: Arc::new(SessionManager::new(log, backend)),
            default_agent_spec: config.agent_spec(),
            http_transports: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}
