//! Stdio Bridge: the three concurrent tasks that move whole JSON-RPC
//! messages between a session's `to_agent`/`from_agent` channels and the
//! agent's stdin/stdout/stderr, plus the handshake that must complete
//! before a session is usable (§4.2).

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Message;
use crate::errors::{BackendError, SessionError};
use crate::jsonrpc;
use crate::message_log::{Direction, MessageLog};

const HANDSHAKE_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of `to_agent`/`from_agent`, small enough that a slow agent
/// applies backpressure to callers (§5).
pub const CHANNEL_CAPACITY: usize = 10;

/// The channel ends handed back to the caller after a bridge is spawned.
/// `from_agent_tx` is kept around so the session's exit monitor can post an
/// error notification onto the same channel the broadcaster consumes.
pub struct BridgeHandles {
    pub to_agent: mpsc::Sender<Message>,
    pub from_agent_tx: mpsc::Sender<Message>,
    pub from_agent_rx: mpsc::Receiver<Message>,
}

/// Start the outbound, inbound and stderr-drain tasks for one session.
/// Returns immediately; the handshake is a separate step performed by the
/// caller against the returned channels.
pub fn spawn_bridge(
    session_id: String,
    stdin: Pin<Box<dyn AsyncWrite + Send>>,
    stdout: Pin<Box<dyn AsyncRead + Send>>,
    stderr: Pin<Box<dyn AsyncRead + Send>>,
    log: MessageLog,
    cancel: CancellationToken,
) -> BridgeHandles {
    let (to_agent_tx, to_agent_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (from_agent_tx, from_agent_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(outbound_task(
        session_id.clone(),
        stdin,
        to_agent_rx,
        from_agent_tx.clone(),
        log.clone(),
        cancel.clone(),
    ));
    tokio::spawn(inbound_task(
        session_id.clone(),
        stdout,
        from_agent_tx.clone(),
        log.clone(),
        cancel.clone(),
    ));
    tokio::spawn(stderr_task(session_id, stderr, cancel));

    BridgeHandles {
        to_agent: to_agent_tx,
        from_agent_tx,
        from_agent_rx,
    }
}

async fn outbound_task(
    session_id: String,
    mut stdin: Pin<Box<dyn AsyncWrite + Send>>,
    mut to_agent_rx: mpsc::Receiver<Message>,
    from_agent_tx: mpsc::Sender<Message>,
    log: MessageLog,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = to_agent_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        log.record_message(&session_id, Direction::RelayToAgent, &message);

        if stdin.write_all(message.as_bytes()).await.is_err() || stdin.write_all(b"\n").await.is_err() {
            warn!(session_id, "agent stdin write failed, notifying clients and cancelling session");
            let err = SessionError::AgentWriteFailed(session_id.clone());
            let notification = jsonrpc::session_error_notification(&session_id, err.notification_reason());
            let _ = from_agent_tx.send(Arc::from(notification.to_string())).await;
            cancel.cancel();
            break;
        }
    }
    debug!(session_id, "outbound bridge task exiting");
}

async fn inbound_task(
    session_id: String,
    stdout: Pin<Box<dyn AsyncRead + Send>>,
    from_agent_tx: mpsc::Sender<Message>,
    log: MessageLog,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(session_id, error = %e, "agent stdout read failed");
                    break;
                }
            },
        };

        if line.trim().is_empty() {
            continue;
        }

        log.record_message(&session_id, Direction::AgentToRelay, &line);

        let message: Message = std::sync::Arc::from(line);
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = from_agent_tx.send(message) => {
                if result.is_err() {
                    break;
                }
            }
        }
    }
    debug!(session_id, "inbound bridge task exiting");
}

async fn stderr_task(
    session_id: String,
    stderr: Pin<Box<dyn AsyncRead + Send>>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => break,
            },
        };
        if !line.trim().is_empty() {
            warn!(session_id, agent_stderr = %line);
        }
    }
}

/// Send `initialize` (id 0) then `session/new` (id 1), waiting for each
/// response in turn, and return the captured `agent_session_id` plus the
/// still-live `from_agent` receiver (§4.2).
pub async fn perform_handshake(
    to_agent: &mpsc::Sender<Message>,
    mut from_agent_rx: mpsc::Receiver<Message>,
    working_directory: &str,
) -> Result<(String, mpsc::Receiver<Message>), BackendError> {
    run_step(
        to_agent,
        &mut from_agent_rx,
        jsonrpc::initialize_request("acp-relay", env!("CARGO_PKG_VERSION")),
        &serde_json::json!(0),
        |_| Ok(()),
    )
    .await?;

    let agent_session_id = run_step(
        to_agent,
        &mut from_agent_rx,
        jsonrpc::session_new_request(working_directory),
        &serde_json::json!(1),
        |response| {
            jsonrpc::result_session_id(response)
                .map(str::to_string)
                .ok_or_else(|| BackendError::HandshakeFailed("session/new missing result.sessionId".into()))
        },
    )
    .await?;

    info!(agent_session_id, "handshake complete");
    Ok((agent_session_id, from_agent_rx))
}

async fn run_step<T>(
    to_agent: &mpsc::Sender<Message>,
    from_agent_rx: &mut mpsc::Receiver<Message>,
    request: serde_json::Value,
    expected_id: &serde_json::Value,
    extract: impl FnOnce(&serde_json::Value) -> Result<T, BackendError>,
) -> Result<T, BackendError> {
    let method = jsonrpc::method_of(&request).unwrap_or("?").to_string();
    let line: Message = std::sync::Arc::from(request.to_string());

    tokio::time::timeout(HANDSHAKE_SEND_TIMEOUT, to_agent.send(line))
        .await
        .map_err(|_| BackendError::Timeout(format!("sending {method}")))?
        .map_err(|_| BackendError::HandshakeFailed(format!("agent closed stdin before {method}")))?;

    loop {
        let response = tokio::time::timeout(HANDSHAKE_RESPONSE_TIMEOUT, from_agent_rx.recv())
            .await
            .map_err(|_| BackendError::Timeout(format!("waiting for {method} response")))?
            .ok_or_else(|| BackendError::HandshakeFailed(format!("agent exited before {method} response")))?;

        let parsed: serde_json::Value = serde_json::from_str(&response)
            .map_err(|e| BackendError::HandshakeFailed(format!("invalid JSON during {method}: {e}")))?;

        let Some(id) = jsonrpc::id_of(&parsed) else {
            // A notification arriving before the handshake response; ignore and keep waiting.
            continue;
        };
        if !jsonrpc::id_matches(id, expected_id) {
            continue;
        }
        if parsed.get("error").is_some() {
            return Err(BackendError::HandshakeFailed(format!(
                "{method} returned an error: {}",
                parsed["error"]
            )));
        }
        return extract(&parsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    use crate::backend::{AgentSpec, DirectProcessBackend, ProcessBackend};

    fn test_log() -> MessageLog {
        let dir = tempdir().unwrap();
        let log = MessageLog::open(&dir.path().join("log.db")).unwrap();
        std::mem::forget(dir);
        log
    }

    /// A tiny shell script that answers `initialize` and `session/new`
    /// exactly as a well-behaved agent would, then echoes anything else.
    const FAKE_AGENT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*) printf '{"jsonrpc":"2.0","id":0,"result":{}}\n' ;;
    *'"method":"session/new"'*) printf '{"jsonrpc":"2.0","id":1,"result":{"sessionId":"agent-sess-1"}}\n' ;;
    *) printf '%s\n' "$line" ;;
  esac
done
"#;

    #[tokio::test]
    async fn handshake_captures_agent_session_id() {
        let backend = DirectProcessBackend::new();
        let dir = tempdir().unwrap();
        let spec = AgentSpec {
            command: "sh".into(),
            args: vec!["-c".into(), FAKE_AGENT.into()],
            env: HashMap::new(),
        };
        let handle = backend.spawn("sess_test", dir.path(), &spec).await.unwrap();
        let (stdin, stdout, stderr, _supervisor) = handle.split();

        let cancel = CancellationToken::new();
        let bridge = spawn_bridge(
            "sess_test".into(),
            stdin,
            stdout,
            stderr,
            test_log(),
            cancel.clone(),
        );

        let (agent_session_id, _from_agent_rx) = tokio::time::timeout(
            Duration::from_secs(5),
            perform_handshake(&bridge.to_agent, bridge.from_agent_rx, dir.path().to_str().unwrap()),
        )
        .await
        .expect("handshake should not time out")
        .unwrap();

        assert_eq!(agent_session_id, "agent-sess-1");
        cancel.cancel();
    }
}
