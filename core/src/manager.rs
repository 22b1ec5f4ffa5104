//! Session Manager: the process-wide registry from session id to [`Session`]
//! (§4.4).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::backend::{AgentSpec, ProcessBackend};
use crate::errors::{LogError, RelayError, SessionError};
use crate::message_log::MessageLog;
use crate::session::{Session, SessionStatus};

/// A session's externally visible summary, for `session/list` (§4.6).
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub working_directory: String,
    pub status: SessionStatus,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    log: MessageLog,
    backend: Arc<dyn ProcessBackend>,
}

impl SessionManager {
    pub fn new(log: MessageLog, backend: Arc<dyn ProcessBackend>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            log,
            backend,
        }
    }

    /// Create a new session: generate its id, run the backend, bridge and
    /// handshake, and register it (§4.4 Create).
    pub async fn create(
        &self,
        working_directory: PathBuf,
        spec: AgentSpec,
    ) -> Result<Arc<Session>, RelayError> {
        let id = format!("sess_{}", short_id());
        let session = Session::create(id.clone(), working_directory, spec, self.backend.as_ref(), self.log.clone())
            .await?;
        self.sessions.lock().await.insert(id, session.clone());
        Ok(session)
    }

    /// Look up a session by id. Lazily evicts sessions the exit monitor has
    /// already marked closed, since lookups after close must fail (§3
    /// invariant).
    pub async fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(id) {
            Some(session) if session.is_ready().await => Ok(session.clone()),
            Some(_) => {
                sessions.remove(id);
                Err(SessionError::NotFound(id.to_string()))
            }
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    /// Close a session and remove it from the registry (§4.4 Close). A
    /// second close, or close of an unknown id, returns not-found.
    pub async fn close(&self, id: &str) -> Result<(), SessionError> {
        let session = self.sessions.lock().await.get(id).cloned();
        let Some(session) = session else {
            return Err(SessionError::NotFound(id.to_string()));
        };
        let result = session.close().await;
        self.sessions.lock().await.remove(id);
        result
    }

    /// All currently registered sessions, for `session/list` (§4.6).
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().await;
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            summaries.push(SessionSummary {
                id: session.id.clone(),
                working_directory: session.working_directory().to_string_lossy().to_string(),
                status: session.status().await,
            });
        }
        summaries
    }

    /// Mark every session the log still lists as open as closed, since
    /// their processes cannot have survived a relay restart (§4.4 Startup
    /// reconciliation).
    pub async fn reconcile_on_startup(&self) -> Result<usize, LogError> {
        self.log.reconcile_on_startup().await
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;

    use crate::backend::DirectProcessBackend;

    fn test_log() -> MessageLog {
        let dir = tempdir().unwrap();
        let log = MessageLog::open(&dir.path().join("log.db")).unwrap();
        std::mem::forget(dir);
        log
    }

    const FAKE_AGENT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*) printf '{"jsonrpc":"2.0","id":0,"result":{}}\n' ;;
    *'"method":"session/new"'*) printf '{"jsonrpc":"2.0","id":1,"result":{"sessionId":"agent-sess-1"}}\n' ;;
    *) printf '%s\n' "$line" ;;
  esac
done
"#;

    fn fake_agent_spec() -> AgentSpec {
        AgentSpec {
            command: "sh".into(),
            args: vec!["-c".into(), FAKE_AGENT.into()],
            env: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_then_get_then_close_then_get_not_found() {
        let manager = SessionManager::new(test_log(), Arc::new(DirectProcessBackend::new()));
        let dir = tempdir().unwrap();

        let session = manager
            .create(dir.path().to_path_buf(), fake_agent_spec())
            .await
            .unwrap();
        let id = session.id.clone();

        assert!(manager.get(&id).await.is_ok());

        manager.close(&id).await.unwrap();
        assert!(matches!(
            manager.get(&id).await.unwrap_err(),
            SessionError::NotFound(_)
        ));
        assert!(matches!(
            manager.close(&id).await.unwrap_err(),
            SessionError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn reconciliation_reports_rows_closed() {
        let log = test_log();
        log.record_session_created("sess_orphan", "/tmp");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let manager = SessionManager::new(log, Arc::new(DirectProcessBackend::new()));
        let updated = manager.reconcile_on_startup().await.unwrap();
        assert_eq!(updated, 1);
    }
}
