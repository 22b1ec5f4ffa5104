//! Connection Manager: per-session registry of attached clients, the
//! broadcaster that fans `from_agent` out to them, and the per-client
//! delivery loop (§4.3).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::message_log::{Direction, MessageLog};

/// A whole JSON-RPC message as it crosses the relay, cheap to clone so the
/// broadcaster can fan one message out to many client buffers without
/// re-allocating.
pub type Message = Arc<str>;

/// Buffer length at which the flow-control policy logs a warning without
/// dropping anything (§4.3).
const WARN_BUFFER_LEN: usize = 10_000;

#[derive(Debug)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

/// A write-capable handle to one attached client's transport (WebSocket
/// frame sink, or the HTTP polling buffer per §9).
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), TransportError>;
}

struct ClientConnection {
    #[allow(dead_code)]
    id: String,
    transport: Arc<dyn ClientTransport>,
    buffer: Mutex<VecDeque<Message>>,
    signal: Notify,
    write_lock: Mutex<()>,
    cancel: CancellationToken,
    #[allow(dead_code)]
    attached_at: DateTime<Utc>,
}

/// Per-session registry of attached clients plus the broadcaster that
/// feeds them from the agent's output channel.
pub struct ConnectionManager {
    session_id: String,
    clients: Mutex<HashMap<String, Arc<ClientConnection>>>,
    broadcaster_started: AtomicBool,
    log: MessageLog,
    self_weak: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Constructed via [`Arc::new_cyclic`] so the manager can hand delivery
    /// loops a [`Weak`] back to itself, letting a failed write detach its
    /// own client instead of just cancelling the delivery loop in place.
    pub fn new(session_id: String, log: MessageLog) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            session_id,
            clients: Mutex::new(HashMap::new()),
            broadcaster_started: AtomicBool::new(false),
            log,
            self_weak: self_weak.clone(),
        })
    }

    /// Attach a new client. Starts this client's delivery loop and
    /// returns its id.
    pub async fn attach(&self, transport: Arc<dyn ClientTransport>) -> String {
        self.attach_with_replay(transport, &[]).await
    }

    /// Attach a resumed client, writing `replay` to its transport before
    /// the connection is registered with the broadcaster.
    ///
    /// Registration happens only after the replay write completes, so the
    /// broadcaster — which only ever sees clients already in `clients` —
    /// cannot buffer a live message for this client while the replay is
    /// still in flight. That ordering is what guarantees replayed history
    /// always precedes any newly broadcast message (§4.6 "sends up to N
    /// prior messages before any new ones").
    pub async fn attach_with_replay(&self, transport: Arc<dyn ClientTransport>, replay: &[Message]) -> String {
        let id = format!("conn_{}", uuid::Uuid::new_v4().simple());
        let connection = Arc::new(ClientConnection {
            id: id.clone(),
            transport,
            buffer: Mutex::new(VecDeque::new()),
            signal: Notify::new(),
            write_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            attached_at: Utc::now(),
        });

        if !replay.is_empty() {
            let _guard = connection.write_lock.lock().await;
            for message in replay {
                if connection.transport.send(message.clone()).await.is_err() {
                    break;
                }
            }
        }

        self.clients
            .lock()
            .await
            .insert(id.clone(), connection.clone());

        let session_id = self.session_id.clone();
        let client_id = id.clone();
        let manager = self.self_weak.clone();
        tokio::spawn(delivery_loop(session_id, client_id, connection, manager));

        id
    }

    /// Detach a client. A no-op if the id is unknown (§4.3).
    pub async fn detach(&self, client_id: &str) {
        if let Some(connection) = self.clients.lock().await.remove(client_id) {
            let dropped = connection.buffer.lock().await.len();
            if dropped > 0 {
                tracing::info!(
                    session_id = %self.session_id,
                    client_id,
                    dropped,
                    "dropping buffered messages on detach"
                );
            }
            connection.cancel.cancel();
        }
    }

    /// Write a message directly to one client's transport, bypassing the
    /// buffer, for responses the dispatcher must send synchronously
    /// (§4.3 "Safe write").
    pub async fn safe_write(&self, client_id: &str, message: Message) -> Result<(), TransportError> {
        let connection = {
            let clients = self.clients.lock().await;
            clients.get(client_id).cloned()
        };
        let Some(connection) = connection else {
            return Err(TransportError(format!("unknown client {client_id}")));
        };
        let _guard = connection.write_lock.lock().await;
        connection.transport.send(message).await
    }

    /// Start the single per-session broadcaster task if it has not
    /// already been started (§4.3 "guarantee: broadcaster starts at most
    /// once per session").
    pub fn start_broadcaster(self: &Arc<Self>, mut from_agent: mpsc::Receiver<Message>) {
        if self.broadcaster_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(message) = from_agent.recv().await {
                manager
                    .log
                    .record_message(&manager.session_id, Direction::RelayToClient, &message);

                let clients = manager.clients.lock().await;
                for connection in clients.values() {
                    let mut buffer = connection.buffer.lock().await;
                    buffer.push_back(message.clone());
                    if buffer.len() == WARN_BUFFER_LEN {
                        warn!(
                            session_id = %manager.session_id,
                            len = buffer.len(),
                            "client buffer crossed warning threshold"
                        );
                    }
                    drop(buffer);
                    connection.signal.notify_one();
                }
            }
        });
    }

    /// Number of currently attached clients, mainly for tests and
    /// diagnostics.
    pub async fn attached_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

async fn delivery_loop(
    session_id: String,
    client_id: String,
    connection: Arc<ClientConnection>,
    manager: Weak<ConnectionManager>,
) {
    loop {
        tokio::select! {
            _ = connection.cancel.cancelled() => break,
            _ = connection.signal.notified() => {}
        }

        let drained: Vec<Message> = {
            let mut buffer = connection.buffer.lock().await;
            buffer.drain(..).collect()
        };

        let _guard = connection.write_lock.lock().await;
        for (i, message) in drained.iter().enumerate() {
            if let Err(e) = connection.transport.send(message.clone()).await {
                let remaining = drained.len() - i;
                warn!(
                    session_id,
                    client_id,
                    remaining,
                    error = %e,
                    "client write failed, dropping remaining tail and detaching"
                );
                connection.cancel.cancel();
                if let Some(manager) = manager.upgrade() {
                    manager.detach(&client_id).await;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingTransport {
        received: AsyncMutex<Vec<Message>>,
        fail_after: Option<usize>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: AsyncMutex::new(Vec::new()),
                fail_after: None,
            })
        }

        fn failing(after: usize) -> Arc<Self> {
            Arc::new(Self {
                received: AsyncMutex::new(Vec::new()),
                fail_after: Some(after),
            })
        }
    }

    #[async_trait]
    impl ClientTransport for RecordingTransport {
        async fn send(&self, message: Message) -> Result<(), TransportError> {
            let mut received = self.received.lock().await;
            if let Some(limit) = self.fail_after {
                if received.len() >= limit {
                    return Err(TransportError("boom".into()));
                }
            }
            received.push(message);
            Ok(())
        }
    }

    fn test_log() -> MessageLog {
        let dir = tempdir().unwrap();
        let log = MessageLog::open(&dir.path().join("log.db")).unwrap();
        std::mem::forget(dir);
        log
    }

    #[tokio::test]
    async fn two_clients_receive_the_same_broadcast_in_order() {
        let manager = ConnectionManager::new("sess_1".into(), test_log());
        let (tx, rx) = mpsc::channel(16);
        manager.start_broadcaster(rx);

        let a = RecordingTransport::new();
        let b = RecordingTransport::new();
        manager.attach(a.clone()).await;
        manager.attach(b.clone()).await;

        tx.send(Arc::from("{\"n\":1}")).await.unwrap();
        tx.send(Arc::from("{\"n\":2}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let a_received = a.received.lock().await.clone();
        let b_received = b.received.lock().await.clone();
        assert_eq!(a_received.len(), 2);
        assert_eq!(b_received.len(), 2);
        assert_eq!(a_received[0].as_ref(), "{\"n\":1}");
        assert_eq!(a_received[1].as_ref(), "{\"n\":2}");
        assert_eq!(&*a_received, &*b_received);
    }

    #[tokio::test]
    async fn detach_removes_client_and_stops_delivery() {
        let manager = ConnectionManager::new("sess_1".into(), test_log());
        let (tx, rx) = mpsc::channel(16);
        manager.start_broadcaster(rx);

        let a = RecordingTransport::new();
        let id = manager.attach(a.clone()).await;
        assert_eq!(manager.attached_count().await, 1);

        manager.detach(&id).await;
        assert_eq!(manager.attached_count().await, 0);

        tx.send(Arc::from("{\"n\":1}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(a.received.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn detach_of_unknown_id_is_a_no_op() {
        let manager = ConnectionManager::new("sess_1".into(), test_log());
        manager.detach("conn_does_not_exist").await;
    }

    #[tokio::test]
    async fn failing_client_is_detached_and_does_not_stall_others() {
        let manager = ConnectionManager::new("sess_1".into(), test_log());
        let (tx, rx) = mpsc::channel(16);
        manager.start_broadcaster(rx);

        let healthy = RecordingTransport::new();
        let failing = RecordingTransport::failing(0);
        manager.attach(healthy.clone()).await;
        manager.attach(failing.clone()).await;

        tx.send(Arc::from("{\"n\":1}")).await.unwrap();
        tx.send(Arc::from("{\"n\":2}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(healthy.received.lock().await.len(), 2);
        assert_eq!(manager.attached_count().await, 1);
    }

    #[tokio::test]
    async fn attach_with_replay_sends_history_before_any_live_broadcast() {
        let manager = ConnectionManager::new("sess_1".into(), test_log());
        let (tx, rx) = mpsc::channel(16);
        manager.start_broadcaster(rx);

        // A live broadcast queued before the resumed client attaches at all.
        tx.send(Arc::from("{\"n\":1}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let client = RecordingTransport::new();
        let replay = vec![Arc::from("{\"history\":1}"), Arc::from("{\"history\":2}")];
        manager.attach_with_replay(client.clone(), &replay).await;

        tx.send(Arc::from("{\"n\":2}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let received = client.received.lock().await.clone();
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].as_ref(), "{\"history\":1}");
        assert_eq!(received[1].as_ref(), "{\"history\":2}");
        assert_eq!(received[2].as_ref(), "{\"n\":2}");
    }

    #[tokio::test]
    async fn safe_write_bypasses_the_buffer() {
        let manager = ConnectionManager::new("sess_1".into(), test_log());
        let transport = RecordingTransport::new();
        let id = manager.attach(transport.clone()).await;

        manager
            .safe_write(&id, Arc::from("{\"direct\":true}"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(transport.received.lock().await.len(), 1);
    }
}
