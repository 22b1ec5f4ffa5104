//! Seed scenario 1 (§8): create a session over HTTP against an echo agent,
//! prompt it, and confirm the response with the matching id comes back.

use acp_relay_core::MessageLog;
use acp_relay_server::config::{BackendMode, ContainerSettings, RelayConfig};
use acp_relay_server::state::AppState;
use serde_json::{json, Value};

/// Reads NDJSON requests on stdin and mirrors each one back, answering the
/// handshake and echoing prompts inside `result.echo`.
const ECHO_AGENT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*) printf '{"jsonrpc":"2.0","id":0,"result":{}}\n' ;;
    *'"method":"session/new"'*) printf '{"jsonrpc":"2.0","id":1,"result":{"sessionId":"agent-sess-1"}}\n' ;;
    *'"method":"session/prompt"'*)
      id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":true}}\n' "$id"
      ;;
    *) printf '%s\n' "$line" ;;
  esac
done
"#;

async fn spawn_relay() -> String {
    let db_path = tempfile::NamedTempFile::new().unwrap().path().to_path_buf();
    let log = MessageLog::open(&db_path).unwrap();

    let config = RelayConfig {
        listen_addr: "127.0.0.1:0".into(),
        db_path,
        backend_mode: BackendMode::Process,
        agent_command: "sh".into(),
        agent_args: vec!["-c".into(), ECHO_AGENT.into()],
        agent_env: std::collections::HashMap::new(),
        container: ContainerSettings {
            image: "unused".into(),
            runtime: None,
            memory_mb: None,
            cpus: None,
        },
    };
    let state = AppState::new(&config, log).unwrap();
    let app = acp_relay_server::build_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn create_and_prompt_over_http() {
    let base_url = spawn_relay().await;
    let client = reqwest::Client::new();

    let create_response: Value = client
        .post(format!("{base_url}/session/new"))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "session/new",
            "id": 1,
            "params": { "workingDirectory": std::env::temp_dir().to_str().unwrap() }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let session_id = create_response["result"]["sessionId"]
        .as_str()
        .expect("session/new should return a sessionId")
        .to_string();

    let prompt_response: Vec<Value> = client
        .post(format!("{base_url}/session/prompt"))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "session/prompt",
            "id": 7,
            "params": {
                "sessionId": session_id,
                "content": [{"type": "text", "text": "hi"}]
            }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let last = prompt_response.last().expect("at least one buffered message");
    assert_eq!(last["id"], json!(7));
    assert_eq!(last["result"]["echo"], json!(true));
}
