//! Append-only durable record of every message the relay sees, keyed by
//! session and direction (§3, §6).
//!
//! `rusqlite` connections are not `Send` across await points the way the
//! rest of the relay is built, so the log runs its own dedicated thread
//! owning a single connection opened in WAL journal mode (concurrent
//! readers, one serialized writer) and driven by a command channel —
//! the same "single writer" discipline the stdio bridge uses for agent
//! stdin (§9).

use std::path::Path;
use std::thread;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::errors::LogError;
use crate::jsonrpc::{self, MessageKind};

/// The four message directions named in §3 and §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRelay,
    RelayToAgent,
    AgentToRelay,
    RelayToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToRelay => "client_to_relay",
            Direction::RelayToAgent => "relay_to_agent",
            Direction::AgentToRelay => "agent_to_relay",
            Direction::RelayToClient => "relay_to_client",
        }
    }

    /// `true` for the two directions replayed on `session/resume` (§4.6).
    pub fn is_replayable(self) -> bool {
        matches!(self, Direction::AgentToRelay | Direction::RelayToClient)
    }
}

fn message_kind_str(message: &Value) -> Option<&'static str> {
    match jsonrpc::classify(message) {
        MessageKind::Request => Some("request"),
        MessageKind::Response => Some("response"),
        MessageKind::Notification => Some("notification"),
    }
}

/// One persisted message row.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub session_id: String,
    pub direction: Direction,
    pub raw: String,
    pub timestamp: DateTime<Utc>,
}

enum Command {
    RecordSessionCreated {
        session_id: String,
        working_directory: String,
    },
    RecordMessage {
        session_id: String,
        direction: Direction,
        raw: String,
    },
    MarkClosed {
        session_id: String,
        reply: oneshot::Sender<Result<(), LogError>>,
    },
    Reconcile {
        reply: oneshot::Sender<Result<usize, LogError>>,
    },
    Replay {
        session_id: String,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<MessageRecord>, LogError>>,
    },
}

/// Handle to the durable message log. Cheap to clone; all clones share the
/// same background writer thread.
#[derive(Clone)]
pub struct MessageLog {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl MessageLog {
    /// Open (creating if needed) the sqlite database at `path` and start
    /// its writer thread.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        thread::Builder::new()
            .name("message-log-writer".into())
            .spawn(move || {
                while let Some(cmd) = cmd_rx.blocking_recv() {
                    handle_command(&conn, cmd);
                }
            })
            .expect("failed to spawn message-log-writer thread");

        Ok(Self { cmd_tx })
    }

    /// Insert a `sessions` row with `closed_at IS NULL` (§6).
    pub fn record_session_created(&self, session_id: &str, working_directory: &str) {
        let _ = self.cmd_tx.send(Command::RecordSessionCreated {
            session_id: session_id.to_string(),
            working_directory: working_directory.to_string(),
        });
    }

    /// Append one message record. Fire-and-forget: the bridge never blocks
    /// on the durable write (it only needs FIFO-per-session ordering,
    /// which the single writer thread preserves).
    pub fn record_message(&self, session_id: &str, direction: Direction, raw: &str) {
        let _ = self.cmd_tx.send(Command::RecordMessage {
            session_id: session_id.to_string(),
            direction,
            raw: raw.to_string(),
        });
    }

    /// Set `closed_at` for a session (§4.4 Close).
    pub async fn mark_closed(&self, session_id: &str) -> Result<(), LogError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::MarkClosed {
                session_id: session_id.to_string(),
                reply,
            })
            .map_err(|_| LogError::WriterClosed)?;
        rx.await.map_err(|_| LogError::WriterClosed)?
    }

    /// Startup reconciliation (§4.4): mark every session the log still
    /// lists as open as closed, since its process cannot have survived a
    /// relay restart. Returns the number of rows updated.
    pub async fn reconcile_on_startup(&self) -> Result<usize, LogError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reconcile { reply })
            .map_err(|_| LogError::WriterClosed)?;
        rx.await.map_err(|_| LogError::WriterClosed)?
    }

    /// Fetch the last `limit` replayable (`agent→relay` / `relay→client`)
    /// messages for a session, oldest first, for `session/resume` (§4.6).
    pub async fn replay(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, LogError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Replay {
                session_id: session_id.to_string(),
                limit,
                reply,
            })
            .map_err(|_| LogError::WriterClosed)?;
        rx.await.map_err(|_| LogError::WriterClosed)?
    }
}

fn init_schema(conn: &Connection) -> Result<(), LogError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            agent_session_id TEXT,
            working_directory TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            closed_at TEXT
        );
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            direction TEXT NOT NULL,
            message_type TEXT,
            method TEXT,
            jsonrpc_id INTEGER,
            raw TEXT NOT NULL,
            timestamp TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_method ON messages(method);
        CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at);
        ",
    )?;
    Ok(())
}

fn handle_command(conn: &Connection, cmd: Command) {
    match cmd {
        Command::RecordSessionCreated {
            session_id,
            working_directory,
        } => {
            if let Err(e) = conn.execute(
                "INSERT INTO sessions (id, working_directory) VALUES (?1, ?2)",
                rusqlite::params![session_id, working_directory],
            ) {
                tracing::warn!("failed to record session creation: {e}");
            }
        }
        Command::RecordMessage {
            session_id,
            direction,
            raw,
        } => {
            let parsed: Option<Value> = serde_json::from_str(&raw).ok();
            let method = parsed.as_ref().and_then(jsonrpc::method_of);
            let kind = parsed.as_ref().and_then(message_kind_str);
            let jsonrpc_id = parsed
                .as_ref()
                .and_then(jsonrpc::id_of)
                .and_then(Value::as_i64);
            if let Err(e) = conn.execute(
                "INSERT INTO messages (session_id, direction, message_type, method, jsonrpc_id, raw)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![session_id, direction.as_str(), kind, method, jsonrpc_id, raw],
            ) {
                tracing::warn!("failed to record message: {e}");
            }
        }
        Command::MarkClosed { session_id, reply } => {
            let result = conn
                .execute(
                    "UPDATE sessions SET closed_at = datetime('now') WHERE id = ?1",
                    rusqlite::params![session_id],
                )
                .map(|_| ())
                .map_err(LogError::from);
            let _ = reply.send(result);
        }
        Command::Reconcile { reply } => {
            let result = conn
                .execute(
                    "UPDATE sessions SET closed_at = datetime('now') WHERE closed_at IS NULL",
                    [],
                )
                .map_err(LogError::from);
            let _ = reply.send(result);
        }
        Command::Replay {
            session_id,
            limit,
            reply,
        } => {
            let result = (|| -> Result<Vec<MessageRecord>, LogError> {
                let mut stmt = conn.prepare(
                    "SELECT direction, raw, timestamp FROM (
                        SELECT direction, raw, timestamp, id FROM messages
                        WHERE session_id = ?1 AND direction IN ('agent_to_relay', 'relay_to_client')
                        ORDER BY id DESC LIMIT ?2
                    ) ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![session_id, limit as i64],
                    |row| {
                        let direction_str: String = row.get(0)?;
                        let raw: String = row.get(1)?;
                        let timestamp: String = row.get(2)?;
                        Ok((direction_str, raw, timestamp))
                    },
                )?;
                let mut records = Vec::new();
                for row in rows {
                    let (direction_str, raw, timestamp) = row?;
                    let direction = match direction_str.as_str() {
                        "agent_to_relay" => Direction::AgentToRelay,
                        _ => Direction::RelayToClient,
                    };
                    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());
                    records.push(MessageRecord {
                        session_id: session_id.clone(),
                        direction,
                        raw,
                        timestamp,
                    });
                }
                Ok(records)
            })();
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn records_and_replays_messages_in_order() {
        let dir = tempdir().unwrap();
        let log = MessageLog::open(&dir.path().join("log.db")).unwrap();
        log.record_session_created("sess_1", "/tmp");
        log.record_message("sess_1", Direction::RelayToAgent, "{\"method\":\"x\"}");
        log.record_message("sess_1", Direction::AgentToRelay, "{\"a\":1}");
        log.record_message("sess_1", Direction::RelayToClient, "{\"a\":2}");

        // Give the writer thread a moment to drain (fire-and-forget inserts).
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let replayed = log.replay("sess_1", 50).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].raw, "{\"a\":1}");
        assert_eq!(replayed[1].raw, "{\"a\":2}");
    }

    #[tokio::test]
    async fn reconciliation_closes_open_sessions() {
        let dir = tempdir().unwrap();
        let log = MessageLog::open(&dir.path().join("log.db")).unwrap();
        log.record_session_created("sess_1", "/tmp");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let updated = log.reconcile_on_startup().await.unwrap();
        assert_eq!(updated, 1);

        log.mark_closed("sess_1").await.unwrap();
    }

    #[tokio::test]
    async fn replay_respects_limit_and_direction_filter() {
        let dir = tempdir().unwrap();
        let log = MessageLog::open(&dir.path().join("log.db")).unwrap();
        log.record_session_created("sess_1", "/tmp");
        for i in 0..5 {
            log.record_message(
                "sess_1",
                Direction::AgentToRelay,
                &format!("{{\"n\":{i}}}"),
            );
        }
        log.record_message("sess_1", Direction::ClientToRelay, "{\"ignored\":true}");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let replayed = log.replay("sess_1", 3).await.unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].raw, "{\"n\":2}");
        assert_eq!(replayed[2].raw, "{\"n\":4}");
    }
}
