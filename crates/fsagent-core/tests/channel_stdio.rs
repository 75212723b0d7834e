//! Channel integration tests against a line-protocol stub server.
//!
//! The stub is a /bin/sh script speaking just enough JSON-RPC over stdio
//! to exercise the handshake, discovery, invocation, and failure paths.
//! Correlation ids are sequential, so replies can be canned: initialize
//! is id 1, tools/list id 2, the first call id 3.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use fsagent_core::mcp::{ChannelErrorKind, ChannelOptions, ServerCommand, ToolChannel};

const INITIALIZE_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.1"}}}"#;
const LIST_REPLY: &str = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"list_directory","description":"List directory contents","inputSchema":{"type":"object","properties":{"path":{"type":"string"}}}}]}}"#;

fn write_stub(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("stub.sh");
    std::fs::write(&path, body).unwrap();
    path
}

fn command(script: &PathBuf) -> ServerCommand {
    ServerCommand {
        program: "/bin/sh".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
    }
}

fn handshake_lines() -> String {
    format!(
        r#"    *'"initialize"'*) printf '%s\n' '{INITIALIZE_REPLY}' ;;
    *'"notifications/initialized"'*) ;;
    *'"tools/list"'*) printf '%s\n' '{LIST_REPLY}' ;;
"#
    )
}

/// Handshake, discovery, one call, and a clean close.
#[tokio::test]
async fn test_happy_path_round_trips() {
    let dir = TempDir::new().unwrap();
    let script = write_stub(
        &dir,
        &format!(
            r#"while IFS= read -r line; do
  case "$line" in
{}    *'"tools/call"'*) printf '%s\n' '{{"jsonrpc":"2.0","id":3,"result":{{"content":[{{"type":"text","text":"a.txt"}},{{"type":"text","text":"b.txt"}}],"isError":false}}}}' ;;
  esac
done
"#,
            handshake_lines()
        ),
    );

    let mut channel = ToolChannel::launch(&command(&script), ChannelOptions::default())
        .await
        .unwrap();
    assert!(channel.is_open());

    let catalog = channel.list_tools().await.unwrap();
    assert_eq!(catalog.len(), 1);
    assert!(catalog.contains("list_directory"));

    let payload = channel
        .invoke("list_directory", &json!({"path": "/tmp"}))
        .await
        .unwrap();
    assert!(!payload.is_error);
    let blocks = payload.content.unwrap();
    assert_eq!(blocks[0].text.as_deref(), Some("a.txt"));
    assert_eq!(blocks[1].text.as_deref(), Some("b.txt"));

    channel.close().await;
    assert!(!channel.is_open());
    channel.close().await; // idempotent
}

/// Notifications and stale replies on the wire are skipped, not errors.
#[tokio::test]
async fn test_stale_and_notification_lines_skipped() {
    let dir = TempDir::new().unwrap();
    let script = write_stub(
        &dir,
        &format!(
            r#"while IFS= read -r line; do
  case "$line" in
{}    *'"tools/call"'*)
      printf '%s\n' '{{"jsonrpc":"2.0","method":"notifications/progress","params":{{}}}}'
      printf '%s\n' '{{"jsonrpc":"2.0","id":1,"result":{{"late":true}}}}'
      printf '%s\n' '{{"jsonrpc":"2.0","id":3,"result":{{"content":[{{"type":"text","text":"ok"}}],"isError":false}}}}'
      ;;
  esac
done
"#,
            handshake_lines()
        ),
    );

    let mut channel = ToolChannel::launch(&command(&script), ChannelOptions::default())
        .await
        .unwrap();
    channel.list_tools().await.unwrap();

    let payload = channel.invoke("list_directory", &json!({})).await.unwrap();
    assert_eq!(payload.content.unwrap()[0].text.as_deref(), Some("ok"));
    channel.close().await;
}

/// A reply id the channel never issued is a protocol error.
#[tokio::test]
async fn test_unknown_reply_id_is_protocol_error() {
    let dir = TempDir::new().unwrap();
    let script = write_stub(
        &dir,
        r#"while IFS= read -r line; do
  case "$line" in
    *'"initialize"'*) printf '%s\n' '{"jsonrpc":"2.0","id":99,"result":{}}' ;;
  esac
done
"#,
    );

    let err = ToolChannel::launch(&command(&script), ChannelOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ChannelErrorKind::Protocol);
}

/// A silent server fails the handshake within the bound.
#[tokio::test]
async fn test_handshake_timeout() {
    let dir = TempDir::new().unwrap();
    let script = write_stub(&dir, "sleep 5\n");

    let options = ChannelOptions {
        handshake_timeout: Duration::from_millis(200),
        ..ChannelOptions::default()
    };
    let err = ToolChannel::launch(&command(&script), options)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ChannelErrorKind::HandshakeTimeout);
    assert!(!err.is_fatal());
}

/// A server that dies mid-call surfaces as the fatal exited kind.
#[tokio::test]
async fn test_subprocess_exit_mid_call() {
    let dir = TempDir::new().unwrap();
    let script = write_stub(
        &dir,
        &format!(
            r#"while IFS= read -r line; do
  case "$line" in
{}    *'"tools/call"'*) exit 0 ;;
  esac
done
"#,
            handshake_lines()
        ),
    );

    let mut channel = ToolChannel::launch(&command(&script), ChannelOptions::default())
        .await
        .unwrap();
    channel.list_tools().await.unwrap();

    let err = channel
        .invoke("list_directory", &json!({"path": "/tmp"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ChannelErrorKind::SubprocessExited);
    assert!(err.is_fatal());
    channel.close().await;
}

/// A slow call times out recoverably and its late reply is skipped on
/// the next round-trip.
#[tokio::test]
async fn test_slow_call_times_out() {
    let dir = TempDir::new().unwrap();
    let script = write_stub(
        &dir,
        &format!(
            r#"calls=0
while IFS= read -r line; do
  case "$line" in
{}    *'"tools/call"'*)
      calls=$((calls + 1))
      if [ "$calls" = 1 ]; then
        sleep 1
        printf '%s\n' '{{"jsonrpc":"2.0","id":3,"result":{{"content":[{{"type":"text","text":"late"}}],"isError":false}}}}'
      else
        printf '%s\n' '{{"jsonrpc":"2.0","id":4,"result":{{"content":[{{"type":"text","text":"prompt"}}],"isError":false}}}}'
      fi
      ;;
  esac
done
"#,
            handshake_lines()
        ),
    );

    let options = ChannelOptions {
        invoke_timeout: Duration::from_millis(200),
        ..ChannelOptions::default()
    };
    let mut channel = ToolChannel::launch(&command(&script), options)
        .await
        .unwrap();
    channel.list_tools().await.unwrap();

    let err = channel
        .invoke("list_directory", &json!({"path": "/slow"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ChannelErrorKind::Timeout);

    // Give the stub time to flush the late reply before the next call.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let payload = channel
        .invoke("list_directory", &json!({"path": "/fast"}))
        .await
        .unwrap();
    assert_eq!(payload.content.unwrap()[0].text.as_deref(), Some("prompt"));
    channel.close().await;
}

/// A server-side tool failure arrives as an error payload, not an Err.
#[tokio::test]
async fn test_server_reported_tool_error() {
    let dir = TempDir::new().unwrap();
    let script = write_stub(
        &dir,
        &format!(
            r#"while IFS= read -r line; do
  case "$line" in
{}    *'"tools/call"'*) printf '%s\n' '{{"jsonrpc":"2.0","id":3,"result":{{"content":[{{"type":"text","text":"permission denied"}}],"isError":true}}}}' ;;
  esac
done
"#,
            handshake_lines()
        ),
    );

    let mut channel = ToolChannel::launch(&command(&script), ChannelOptions::default())
        .await
        .unwrap();
    channel.list_tools().await.unwrap();

    let payload = channel
        .invoke("write_file", &json!({"path": "/etc/passwd"}))
        .await
        .unwrap();
    assert!(payload.is_error);
    assert_eq!(
        payload.content.unwrap()[0].text.as_deref(),
        Some("permission denied")
    );
    channel.close().await;
}

/// A missing program fails with the launch kind.
#[tokio::test]
async fn test_spawn_failure() {
    let command = ServerCommand {
        program: "/nonexistent/fsagent-stub".to_string(),
        args: vec![],
    };
    let err = ToolChannel::launch(&command, ChannelOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ChannelErrorKind::Launch);
}
