//! ACP relay: a long-lived server that bridges HTTP and WebSocket clients
//! to agent subprocesses speaking the Agent Client Protocol over stdio.

use tracing::info;
use tracing_subscriber::EnvFilter;

use acp_relay_server::config::RelayConfig;
use acp_relay_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RelayConfig::from_env();
    info!(
        listen_addr = %config.listen_addr,
        db_path = %config.db_path.display(),
        backend = ?config.backend_mode,
        "acp-relay starting"
    );

    let log = acp_relay_core::MessageLog::open(&config.db_path)?;
    let reconciled = log.reconcile_on_startup().await?;
    if reconciled > 0 {
        info!(reconciled, "closed stale sessions left open by a previous run");
    }

    let state = AppState::new(&config, log)?;
    let app = acp_relay_server::build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Structured logging to stderr, never stdout (stdout on the agent side
/// carries the JSON-RPC wire protocol).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}
