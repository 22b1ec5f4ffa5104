//! Session: the central entity of §3, owning the backend handle, the
//! stdio bridge, and the connection manager for one agent conversation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{AgentSpec, BackendKind, BackendSupervisor, ProcessBackend};
use crate::bridge;
use crate::connection::{ConnectionManager, Message};
use crate::errors::{RelayError, SessionError};
use crate::jsonrpc;
use crate::message_log::{Direction, MessageLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ready,
    Closed,
}

/// A single conversation with one agent subprocess (§3).
pub struct Session {
    pub id: String,
    pub working_directory: PathBuf,
    pub backend_kind: BackendKind,
    pub agent_session_id: String,
    pub connection_manager: Arc<ConnectionManager>,
    status: RwLock<SessionStatus>,
    to_agent: mpsc::Sender<Message>,
    /// Held until the first caller starts the broadcaster (§4.3 "broadcaster
    /// starts at most once per session").
    from_agent_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    cancel: CancellationToken,
    log: MessageLog,
    exit_done: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("working_directory", &self.working_directory)
            .field("backend_kind", &self.backend_kind)
            .field("agent_session_id", &self.agent_session_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the backend, bridge and handshake for a new session (§4.4
    /// Create). On any failure, tears down in reverse order and returns the
    /// first error; nothing is left running.
    pub async fn create(
        id: String,
        working_directory: PathBuf,
        spec: AgentSpec,
        backend: &dyn ProcessBackend,
        log: MessageLog,
    ) -> Result<Arc<Session>, RelayError> {
        let handle = backend.spawn(&id, &working_directory, &spec).await?;
        let backend_kind = handle.kind;
        let (stdin, stdout, stderr, supervisor) = handle.split();

        let cancel = CancellationToken::new();
        let working_directory_str = working_directory.to_string_lossy().to_string();
        let bridge_handles = bridge::spawn_bridge(
            id.clone(),
            stdin,
            stdout,
            stderr,
            log.clone(),
            cancel.clone(),
        );

        match bridge::perform_handshake(
            &bridge_handles.to_agent,
            bridge_handles.from_agent_rx,
            &working_directory_str,
        )
        .await
        {
            Ok((agent_session_id, from_agent_rx)) => {
                log.record_session_created(&id, &working_directory_str);

                let connection_manager = ConnectionManager::new(id.clone(), log.clone());

                let session = Arc::new(Session {
                    id,
                    working_directory,
                    backend_kind,
                    agent_session_id,
                    connection_manager,
                    status: RwLock::new(SessionStatus::Ready),
                    to_agent: bridge_handles.to_agent,
                    from_agent_rx: Mutex::new(Some(from_agent_rx)),
                    cancel,
                    log,
                    exit_done: Notify::new(),
                });

                spawn_exit_monitor(session.clone(), supervisor, bridge_handles.from_agent_tx);

                Ok(session)
            }
            Err(e) => {
                cancel.cancel();
                let mut supervisor = supervisor;
                let _ = supervisor.kill().await;
                let _ = supervisor.wait().await;
                Err(RelayError::Backend(e))
            }
        }
    }

    /// Start the connection manager's broadcaster, if it has not already
    /// been started for this session. Idempotent.
    pub async fn start_broadcaster(self: &Arc<Self>) {
        let Some(receiver) = self.from_agent_rx.lock().await.take() else {
            return;
        };
        self.connection_manager.start_broadcaster(receiver);
    }

    /// Forward a whole JSON-RPC message to the agent.
    pub async fn send_to_agent(&self, message: Message) -> Result<(), SessionError> {
        self.to_agent
            .send(message)
            .await
            .map_err(|_| SessionError::AgentWriteFailed(self.id.clone()))
    }

    /// Log a client-originated message (§2, §3, §8: every hop persists to
    /// the message log with a direction tag, including client→relay).
    pub fn record_client_message(&self, raw: &str) {
        self.log.record_message(&self.id, Direction::ClientToRelay, raw);
    }

    pub async fn is_ready(&self) -> bool {
        *self.status.read().await == SessionStatus::Ready
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    /// Replay the last `limit` replayable log records for this session
    /// (§4.6 `session/resume` / `session/history`).
    pub async fn replay(&self, limit: usize) -> Result<Vec<crate::message_log::MessageRecord>, crate::errors::LogError> {
        self.log.replay(&self.id, limit).await
    }

    /// Trip cancellation, tear the backend down, mark the log session
    /// closed, and wait for that teardown to finish (§4.4 Close).
    pub async fn close(&self) -> Result<(), SessionError> {
        {
            let mut status = self.status.write().await;
            if *status == SessionStatus::Closed {
                return Err(SessionError::AlreadyClosed(self.id.clone()));
            }
            *status = SessionStatus::Closed;
        }
        let notified = self.exit_done.notified();
        self.cancel.cancel();
        notified.await;
        Ok(())
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }
}

fn spawn_exit_monitor(
    session: Arc<Session>,
    mut supervisor: BackendSupervisor,
    from_agent_tx: mpsc::Sender<Message>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = session.cancel.cancelled() => {
                let _ = supervisor.kill().await;
                let _ = supervisor.wait().await;
            }
            result = supervisor.wait() => {
                let err = SessionError::AgentExit(session.id.clone());
                warn!(session_id = %session.id, exit_code = ?result, "agent exited unexpectedly");
                let notification = jsonrpc::session_error_notification(&session.id, err.notification_reason());
                let _ = from_agent_tx.send(Arc::from(notification.to_string())).await;
                session.cancel.cancel();
            }
        }

        *session.status.write().await = SessionStatus::Closed;
        let _ = session.log.mark_closed(&session.id).await;
        session.exit_done.notify_waiters();
    });
}
