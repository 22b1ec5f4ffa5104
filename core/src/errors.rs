//! Unified error types for the relay core.
//!
//! Each consumer (HTTP adapter, WebSocket adapter) maps these into its own
//! transport error shape; the core itself only needs to know the JSON-RPC
//! error code a given failure corresponds to.

use thiserror::Error;

/// Top-level error type encompassing all core error categories.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("message log error: {0}")]
    Log(#[from] LogError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// The JSON-RPC 2.0 error code (§7 of the spec) this error maps to.
    pub fn code(&self) -> i64 {
        match self {
            RelayError::Backend(BackendError::Timeout(_)) => jsonrpc_codes::AGENT_CONNECTION_TIMEOUT,
            RelayError::Backend(_) => jsonrpc_codes::INTERNAL_ERROR,
            RelayError::Session(SessionError::NotFound(_)) => jsonrpc_codes::SESSION_NOT_FOUND,
            RelayError::Session(SessionError::AgentWriteFailed(_)) => jsonrpc_codes::AGENT_WRITE_FAILED,
            RelayError::Session(SessionError::AgentExit(_)) => jsonrpc_codes::AGENT_EXIT,
            RelayError::Session(_) => jsonrpc_codes::INTERNAL_ERROR,
            RelayError::Log(_) => jsonrpc_codes::INTERNAL_ERROR,
            RelayError::Io(_) => jsonrpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Errors raised while starting or supervising an agent backend (process or
/// container).
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    #[error("failed to attach to backend stdio: {0}")]
    AttachFailed(String),

    #[error("handshake timed out: {0}")]
    Timeout(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to session lifecycle and lookup.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already closed: {0}")]
    AlreadyClosed(String),

    #[error("agent write failed: {0}")]
    AgentWriteFailed(String),

    #[error("agent exited unexpectedly: {0}")]
    AgentExit(String),
}

impl SessionError {
    /// The `reason` string placed in a `session/error` notification for
    /// this error, where one applies (§4.2, §7).
    pub fn notification_reason(&self) -> &'static str {
        match self {
            SessionError::AgentWriteFailed(_) => "agent_write_failed",
            SessionError::AgentExit(_) => "agent_exit",
            SessionError::NotFound(_) => "session_not_found",
            SessionError::AlreadyClosed(_) => "already_closed",
        }
    }
}

/// Errors raised by the message log.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("log writer channel closed")]
    WriterClosed,
}

/// Standard and application-specific JSON-RPC 2.0 error codes (§7).
pub mod jsonrpc_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const SESSION_NOT_FOUND: i64 = -32000;
    pub const AGENT_CONNECTION_TIMEOUT: i64 = -32001;
    pub const AGENT_WRITE_FAILED: i64 = -32002;
    pub const AGENT_EXIT: i64 = -32003;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_maps_to_expected_code() {
        let err = RelayError::Session(SessionError::NotFound("sess_x".into()));
        assert_eq!(err.code(), jsonrpc_codes::SESSION_NOT_FOUND);
    }

    #[test]
    fn handshake_timeout_maps_to_agent_connection_timeout() {
        let err = RelayError::Backend(BackendError::Timeout("initialize".into()));
        assert_eq!(err.code(), jsonrpc_codes::AGENT_CONNECTION_TIMEOUT);
    }

    #[test]
    fn agent_write_failed_and_agent_exit_map_to_their_own_codes() {
        let write_err = RelayError::Session(SessionError::AgentWriteFailed("sess_x".into()));
        assert_eq!(write_err.code(), jsonrpc_codes::AGENT_WRITE_FAILED);

        let exit_err = RelayError::Session(SessionError::AgentExit("sess_x".into()));
        assert_eq!(exit_err.code(), jsonrpc_codes::AGENT_EXIT);
    }

    #[test]
    fn standard_codes_in_json_rpc_range() {
        for code in [
            jsonrpc_codes::PARSE_ERROR,
            jsonrpc_codes::INVALID_REQUEST,
            jsonrpc_codes::METHOD_NOT_FOUND,
            jsonrpc_codes::INVALID_PARAMS,
            jsonrpc_codes::INTERNAL_ERROR,
        ] {
            assert!((-32768..=-32000).contains(&code));
        }
    }
}
