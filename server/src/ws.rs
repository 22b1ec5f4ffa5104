//! WebSocket Adapter (§4.6): a stateful, bidirectional counterpart to the
//! HTTP adapter. One socket attaches to at most one session at a time and
//! is just another [`ClientTransport`] as far as the connection manager is
//! concerned.

use std::path::PathBuf;
use std::sync::Arc;

use acp_relay_core::connection::{ClientTransport, Message, TransportError};
use acp_relay_core::{jsonrpc, RelayError, Session};
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// A [`ClientTransport`] backed by the outbound half of this socket's
/// message channel.
struct WsTransport {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError("socket closed".into()))
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    // No origin checking: any origin is accepted (§4.6).
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    use axum::extract::ws::Message::Text;
    use futures_util::{SinkExt, StreamExt};

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let outbound = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sink.send(Text(message.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    let current_session: Arc<Mutex<Option<Arc<Session>>>> = Arc::new(Mutex::new(None));
    let client_id: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    while let Some(Ok(frame)) = ws_stream.next().await {
        match frame {
            Text(text) => {
                dispatch(&state, &tx, &current_session, &client_id, &text).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    outbound.abort();

    let session = current_session.lock().await.clone();
    let id = client_id.lock().await.clone();
    if let (Some(session), Some(id)) = (session, id) {
        session.connection_manager.detach(&id).await;
    }
}

async fn dispatch(
    state: &AppState,
    tx: &mpsc::UnboundedSender<Message>,
    current_session: &Arc<Mutex<Option<Arc<Session>>>>,
    client_id: &Arc<Mutex<Option<String>>>,
    text: &str,
) {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        let _ = send_direct(tx, json!({"jsonrpc":"2.0","error":{"code":-32700,"message":"invalid JSON"},"id":null}));
        return;
    };

    let Some(method) = jsonrpc::method_of(&parsed) else {
        // No `method` field: a client-originated response (e.g. a permission
        // reply), forwarded to the agent verbatim.
        if let Some(session) = current_session.lock().await.clone() {
            session.record_client_message(text);
            let _ = session.send_to_agent(Arc::from(text)).await;
        }
        return;
    };

    match method {
        "session/new" => handle_session_new(state, tx, current_session, client_id, &parsed).await,
        "session/resume" => handle_session_resume(state, tx, current_session, client_id, &parsed).await,
        "session/prompt" => handle_session_prompt(current_session, &parsed, text).await,
        "session/list" => handle_session_list(state, tx, &parsed).await,
        "session/history" => handle_session_history(state, tx, &parsed).await,
        _ => {
            if let Some(session) = current_session.lock().await.clone() {
                session.record_client_message(text);
                let _ = session.send_to_agent(Arc::from(text)).await;
            } else {
                let _ = send_direct(
                    tx,
                    json!({"jsonrpc":"2.0","error":{"code":-32601,"message":format!("no active session for {method}")},"id":jsonrpc::id_of(&parsed)}),
                );
            }
        }
    }
}

async fn handle_session_new(
    state: &AppState,
    tx: &mpsc::UnboundedSender<Message>,
    current_session: &Arc<Mutex<Option<Arc<Session>>>>,
    client_id: &Arc<Mutex<Option<String>>>,
    request: &Value,
) {
    let id = jsonrpc::id_of(request).cloned().unwrap_or(Value::Null);
    let Some(working_directory) = request
        .get("params")
        .and_then(|p| p.get("workingDirectory"))
        .and_then(Value::as_str)
    else {
        let _ = send_direct(tx, error_envelope(id, -32602, "params.workingDirectory is required"));
        return;
    };
    let working_directory = working_directory.to_string();

    match state
        .sessions
        .create(PathBuf::from(working_directory), state.default_agent_spec.clone())
        .await
    {
        Ok(session) => {
            let transport = Arc::new(WsTransport { tx: tx.clone() });
            let new_client_id = session.connection_manager.attach(transport).await;
            session.start_broadcaster().await;

            *client_id.lock().await = Some(new_client_id.clone());
            *current_session.lock().await = Some(session.clone());

            info!(session_id = %session.id, client_id = %new_client_id, "WS session/new");
            let _ = session
                .connection_manager
                .safe_write(
                    &new_client_id,
                    to_message(json!({"jsonrpc":"2.0","result":{"sessionId":session.id,"clientId":new_client_id},"id":id})),
                )
                .await;
        }
        Err(e) => {
            let _ = send_direct(tx, error_from_relay(id, &e));
        }
    }
}

async fn handle_session_resume(
    state: &AppState,
    tx: &mpsc::UnboundedSender<Message>,
    current_session: &Arc<Mutex<Option<Arc<Session>>>>,
    client_id: &Arc<Mutex<Option<String>>>,
    request: &Value,
) {
    let id = jsonrpc::id_of(request).cloned().unwrap_or(Value::Null);
    let Some(session_id) = jsonrpc::params_session_id(request) else {
        let _ = send_direct(tx, error_envelope(id, -32602, "params.sessionId is required"));
        return;
    };

    let session = match state.sessions.get(session_id).await {
        Ok(session) => session,
        Err(e) => {
            let _ = send_direct(tx, error_from_relay(id, &RelayError::Session(e)));
            return;
        }
    };

    let replay: Vec<Message> = session
        .replay(DEFAULT_HISTORY_LIMIT)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|record| Message::from(record.raw))
        .collect();

    let transport = Arc::new(WsTransport { tx: tx.clone() });
    let new_client_id = session
        .connection_manager
        .attach_with_replay(transport, &replay)
        .await;
    *client_id.lock().await = Some(new_client_id.clone());
    *current_session.lock().await = Some(session.clone());

    session.start_broadcaster().await;
    let _ = session
        .connection_manager
        .safe_write(
            &new_client_id,
            to_message(json!({"jsonrpc":"2.0","result":{"sessionId":session.id,"clientId":new_client_id},"id":id})),
        )
        .await;
}

async fn handle_session_prompt(
    current_session: &Arc<Mutex<Option<Arc<Session>>>>,
    request: &Value,
    raw: &str,
) {
    let Some(session) = current_session.lock().await.clone() else {
        return;
    };
    let Some(content) = jsonrpc::params_content(request) else {
        return;
    };
    session.record_client_message(raw);
    let id = jsonrpc::id_of(request).cloned().unwrap_or(Value::Null);
    let agent_request = jsonrpc::agent_prompt_request(&id, &session.agent_session_id, content);
    let _ = session.send_to_agent(to_message(agent_request)).await;
}

async fn handle_session_list(state: &AppState, tx: &mpsc::UnboundedSender<Message>, request: &Value) {
    let id = jsonrpc::id_of(request).cloned().unwrap_or(Value::Null);
    let summaries = state.sessions.list().await;
    let sessions: Vec<Value> = summaries
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "workingDirectory": s.working_directory,
                "status": format!("{:?}", s.status).to_lowercase(),
            })
        })
        .collect();
    let _ = send_direct(tx, json!({"jsonrpc":"2.0","result":{"sessions":sessions},"id":id}));
}

async fn handle_session_history(state: &AppState, tx: &mpsc::UnboundedSender<Message>, request: &Value) {
    let id = jsonrpc::id_of(request).cloned().unwrap_or(Value::Null);
    let Some(session_id) = jsonrpc::params_session_id(request) else {
        let _ = send_direct(tx, error_envelope(id, -32602, "params.sessionId is required"));
        return;
    };

    let session = match state.sessions.get(session_id).await {
        Ok(session) => session,
        Err(e) => {
            let _ = send_direct(tx, error_from_relay(id, &RelayError::Session(e)));
            return;
        }
    };

    match session.replay(DEFAULT_HISTORY_LIMIT).await {
        Ok(records) => {
            let history: Vec<Value> = records
                .into_iter()
                .filter_map(|r| serde_json::from_str(&r.raw).ok())
                .collect();
            let _ = send_direct(tx, json!({"jsonrpc":"2.0","result":{"history":history},"id":id}));
        }
        Err(e) => {
            warn!(session_id, error = %e, "history replay failed");
            let _ = send_direct(tx, error_envelope(id, -32603, "failed to replay history"));
        }
    }
}

fn to_message(value: Value) -> Message {
    Arc::from(value.to_string())
}

fn send_direct(tx: &mpsc::UnboundedSender<Message>, value: Value) -> Result<(), ()> {
    tx.send(to_message(value)).map_err(|_| ())
}

fn error_envelope(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc":"2.0","error":{"code":code,"message":message},"id":id})
}

fn error_from_relay(id: Value, err: &RelayError) -> Value {
    json!({"jsonrpc":"2.0","error":{"code":err.code(),"message":err.to_string()},"id":id})
}
