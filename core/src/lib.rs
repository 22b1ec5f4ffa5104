//! Core of the ACP relay: session lifecycle, the stdio bridge to agent
//! subprocesses, the connection manager that fans agent output out to
//! attached clients, and the durable message log.
//!
//! Transport adapters (HTTP, WebSocket) live outside this crate and talk to
//! it only through [`manager::SessionManager`] and [`connection::ClientTransport`].

pub mod backend;
pub mod bridge;
pub mod connection;
pub mod errors;
pub mod jsonrpc;
pub mod manager;
pub mod message_log;
pub mod session;

pub use connection::{ClientTransport, ConnectionManager, Message};
pub use errors::{BackendError, LogError, RelayError, SessionError};
pub use manager::{SessionManager, SessionSummary};
pub use message_log::MessageLog;
pub use session::{Session, SessionStatus};
