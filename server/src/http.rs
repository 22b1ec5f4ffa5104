//! HTTP Adapter (§4.5). HTTP is stateless, so a long-lived attached client
//! is faked: `POST /session/new` attaches a synthetic polling-buffer client
//! to the session's connection manager (per §9, just another [`ClientTransport`]),
//! and `POST /session/prompt` polls that same buffer until the response to
//! its request id shows up or 30 s elapse.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acp_relay_core::connection::{ClientTransport, Message, TransportError};
use acp_relay_core::{jsonrpc, RelayError};
use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::protocol::{JsonRpcErrorResponse, JsonRpcRequest, JsonRpcResponse};
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// A [`ClientTransport`] that never fails: every broadcast message is
/// appended to an in-memory log the polling handler reads directly.
pub struct HttpPollTransport {
    buffer: Mutex<Vec<Message>>,
}

impl HttpPollTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(Vec::new()),
        })
    }

    async fn snapshot(&self) -> Vec<Message> {
        self.buffer.lock().await.clone()
    }
}

#[async_trait]
impl ClientTransport for HttpPollTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.buffer.lock().await.push(message);
        Ok(())
    }
}

/// `POST /session/new` — create a session, attach its synthetic HTTP
/// polling client, start the broadcaster, and return `{sessionId}`.
pub async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<JsonRpcRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return ok_json(JsonRpcErrorResponse::parse_error(Value::Null, e.body_text())),
    };
    if body.method != "session/new" {
        return ok_json(JsonRpcErrorResponse::method_not_found(body.id, &body.method));
    }
    let Some(working_directory) = body.params.get("workingDirectory").and_then(Value::as_str) else {
        return ok_json(JsonRpcErrorResponse::invalid_params(
            body.id,
            "params.workingDirectory is required",
        ));
    };

    let spec = state.default_agent_spec.clone();
    match state
        .sessions
        .create(PathBuf::from(working_directory), spec)
        .await
    {
        Ok(session) => {
            let transport = HttpPollTransport::new();
            session.connection_manager.attach(transport.clone()).await;
            session.start_broadcaster().await;
            state
                .http_transports
                .lock()
                .await
                .insert(session.id.clone(), transport);

            info!(session_id = %session.id, working_directory, "HTTP session created");
            ok_json(JsonRpcResponse::new(body.id, json!({ "sessionId": session.id })))
        }
        Err(e) => {
            warn!(error = %e, "HTTP session creation failed");
            ok_json(JsonRpcErrorResponse::from_relay_error(body.id, &e))
        }
    }
}

/// `POST /session/prompt` — forward a prompt to the agent and poll the
/// session's HTTP buffer until its response arrives or 30 s elapse.
pub async fn prompt(
    State(state): State<AppState>,
    body: Result<Json<JsonRpcRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return ok_json(JsonRpcErrorResponse::parse_error(Value::Null, e.body_text())),
    };
    let request_id = body.id.clone();

    if body.method != "session/prompt" {
        return ok_json(JsonRpcErrorResponse::method_not_found(request_id, &body.method));
    }

    let Some(session_id) = body.params.get("sessionId").and_then(Value::as_str) else {
        return ok_json(JsonRpcErrorResponse::invalid_params(
            request_id,
            "params.sessionId is required",
        ));
    };
    let Some(content) = body.params.get("content") else {
        return ok_json(JsonRpcErrorResponse::invalid_params(
            request_id,
            "params.content is required",
        ));
    };

    let session = match state.sessions.get(session_id).await {
        Ok(session) => session,
        Err(e) => return ok_json(JsonRpcErrorResponse::from_relay_error(request_id, &RelayError::Session(e))),
    };

    let Some(transport) = state.http_transports.lock().await.get(session_id).cloned() else {
        return ok_json(JsonRpcErrorResponse::internal_error(
            request_id,
            "session has no HTTP polling buffer",
        ));
    };

    session.record_client_message(&serde_json::to_string(&body).unwrap_or_default());

    let agent_request = jsonrpc::agent_prompt_request(&request_id, &session.agent_session_id, content);
    let message: Message = Arc::from(agent_request.to_string());
    if session.send_to_agent(message).await.is_err() {
        return ok_json(JsonRpcErrorResponse::internal_error(
            request_id,
            "agent write failed",
        ));
    }

    let deadline = tokio::time::Instant::now() + PROMPT_TIMEOUT;
    loop {
        let snapshot = transport.snapshot().await;
        let parsed: Vec<Value> = snapshot
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .collect();

        if parsed
            .iter()
            .any(|v| jsonrpc::id_of(v).is_some_and(|id| jsonrpc::id_matches(id, &request_id)))
        {
            return (StatusCode::OK, Json(parsed)).into_response();
        }

        if tokio::time::Instant::now() >= deadline {
            return ok_json(JsonRpcErrorResponse::internal_error(
                request_id,
                "timed out waiting for agent response",
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn ok_json(body: impl serde::Serialize) -> axum::response::Response {
    (StatusCode::OK, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_transport_accumulates_every_message() {
        let transport = HttpPollTransport::new();
        transport.send(Arc::from("{\"n\":1}")).await.unwrap();
        transport.send(Arc::from("{\"n\":2}")).await.unwrap();
        let snapshot = transport.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].as_ref(), "{\"n\":1}");
    }
}
