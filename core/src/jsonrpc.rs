//! Minimal JSON-RPC 2.0 helpers shared by the stdio bridge and the
//! transport adapters.
//!
//! The core only ever inspects `method`, `id`, `params.sessionId`,
//! `params.content` and `result.sessionId` (§4.7); everything else in a
//! message is opaque bytes that pass through unmodified. The `id` field in
//! particular is kept as a raw [`serde_json::Value`] so integer, string and
//! null ids round-trip exactly instead of being coerced to one Rust type.

use serde_json::{json, Value};

/// A single line of the wire protocol: one JSON value, no embedded newline.
pub fn encode_line(value: &Value) -> String {
    let mut line = serde_json::to_string(value).expect("Value always serializes");
    line.push('\n');
    line
}

/// Split a chunk of stdout/stdin bytes into complete NDJSON lines.
///
/// Empty lines are skipped rather than treated as errors, per the framing
/// invariants in §4.2.
pub fn parse_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.split('\n').filter(|l| !l.trim().is_empty())
}

/// Build the `initialize` request sent as id `0` during the handshake.
pub fn initialize_request(client_name: &str, client_version: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": "initialize",
        "params": {
            "protocolVersion": 1,
            "clientInfo": { "name": client_name, "version": client_version },
            "capabilities": {}
        }
    })
}

/// Build the `session/new` request sent as id `1` during the handshake.
pub fn session_new_request(working_directory: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "session/new",
        "params": { "cwd": working_directory, "mcpServers": [] }
    })
}

/// Build a `session/prompt` request addressed to the agent, rewriting the
/// relay-facing `sessionId`/`content` fields into the agent-facing
/// `sessionId`/`prompt` shape (§4.5 / §4.6).
pub fn agent_prompt_request(id: &Value, agent_session_id: &str, content: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "session/prompt",
        "params": {
            "sessionId": agent_session_id,
            "prompt": content,
        }
    })
}

/// Build the `session/error` notification broadcast to attached clients
/// when a session dies outside of a client-initiated close — either the
/// agent process exited on its own, or a write to its stdin failed while
/// it was still alive (§4.2, §7).
pub fn session_error_notification(session_id: &str, reason: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "session/error",
        "params": { "sessionId": session_id, "reason": reason }
    })
}

/// The `method` field of a parsed message, if present.
pub fn method_of(message: &Value) -> Option<&str> {
    message.get("method").and_then(Value::as_str)
}

/// The `id` field of a parsed message as an opaque token, if present.
pub fn id_of(message: &Value) -> Option<&Value> {
    message.get("id")
}

/// `true` if two id tokens are equal by serialized-bytes equality, so an
/// integer id never matches a string id even if their textual forms agree
/// (§9 "Request-id matching").
pub fn id_matches(candidate: &Value, expected: &Value) -> bool {
    candidate == expected
}

/// `params.sessionId` of a parsed client request, if present.
pub fn params_session_id(message: &Value) -> Option<&str> {
    message.get("params")?.get("sessionId")?.as_str()
}

/// `params.content` of a parsed client request, if present.
pub fn params_content(message: &Value) -> Option<&Value> {
    message.get("params")?.get("content")
}

/// `result.sessionId` of a parsed agent response, if present.
pub fn result_session_id(message: &Value) -> Option<&str> {
    message.get("result")?.get("sessionId")?.as_str()
}

/// Classify a parsed message into request / response / notification, the
/// `message_type` stored alongside each log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

pub fn classify(message: &Value) -> MessageKind {
    let has_method = message.get("method").is_some();
    let has_id = message.get("id").is_some();
    match (has_method, has_id) {
        (true, true) => MessageKind::Request,
        (true, false) => MessageKind::Notification,
        (false, _) => MessageKind::Response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lines_skips_empty_lines() {
        let raw = "{\"a\":1}\n\n{\"b\":2}\n";
        let lines: Vec<&str> = parse_lines(raw).collect();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn encode_line_appends_single_newline() {
        let v = json!({"id": 1});
        let line = encode_line(&v);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn id_matches_distinguishes_int_from_string() {
        assert!(!id_matches(&json!(7), &json!("7")));
        assert!(id_matches(&json!(7), &json!(7)));
        assert!(id_matches(&json!("abc"), &json!("abc")));
    }

    #[test]
    fn classify_distinguishes_kinds() {
        assert_eq!(
            classify(&json!({"method": "x", "id": 1})),
            MessageKind::Request
        );
        assert_eq!(
            classify(&json!({"method": "x"})),
            MessageKind::Notification
        );
        assert_eq!(classify(&json!({"result": {}})), MessageKind::Response);
    }

    #[test]
    fn result_session_id_extracts_nested_field() {
        let msg = json!({"result": {"sessionId": "agent-123"}});
        assert_eq!(result_session_id(&msg), Some("agent-123"));
    }

    #[test]
    fn params_session_id_and_content_extract_fields() {
        let msg = json!({"params": {"sessionId": "sess_1", "content": [{"type": "text"}]}});
        assert_eq!(params_session_id(&msg), Some("sess_1"));
        assert!(params_content(&msg).is_some());
    }
}
