//! End-to-end tests driving a real server over WebSocket.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use cmux_shell::{serve, AppState, IsolationTool, ShellConfig};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

struct TestServer {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server(workspace_root: &Path) -> TestServer {
    let config = ShellConfig::default()
        .with_workspace_root(workspace_root)
        .with_isolation(IsolationTool::Disabled)
        .with_shell_candidates(["/bin/sh"]);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let shutdown = async {
            let _ = rx.await;
        };
        serve(listener, AppState::new(config), shutdown).await.unwrap();
    });

    TestServer {
        addr,
        _shutdown: tx,
    }
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let url = format!("ws://{}/ws/terminal/{}", addr, query);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Next JSON frame, or `None` once the server closed the connection.
async fn next_frame(ws: &mut Client) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(FRAME_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")?;
        match msg {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

fn frame_type(frame: &Value) -> &str {
    frame["type"].as_str().unwrap_or_default()
}

fn frame_data(frame: &Value) -> &str {
    frame["data"].as_str().unwrap_or_default()
}

fn workspaces(root: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(root)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pwd_reports_workspace_and_disconnect_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let server = start_server(root.path()).await;
    let mut ws = connect(server.addr, "?session=abc123").await;

    let welcome = next_frame(&mut ws).await.unwrap();
    assert_eq!(frame_type(&welcome), "output");
    assert!(frame_data(&welcome).contains("abc123"));

    let created = workspaces(root.path());
    assert_eq!(created.len(), 1);
    let workspace = created[0].display().to_string();

    ws.send(Message::Text(r#"{"input": "pwd"}"#.into()))
        .await
        .unwrap();

    let mut output = String::new();
    while !output.contains(&workspace) {
        let frame = next_frame(&mut ws).await.expect("connection closed early");
        assert_eq!(frame_type(&frame), "output", "{}", frame);
        output.push_str(frame_data(&frame));
    }

    ws.close(None).await.unwrap();
    // Drain until the server closes its side.
    while next_frame(&mut ws).await.is_some() {}

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !workspaces(root.path()).is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(workspaces(root.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_session_is_rejected_without_workspace() {
    let root = tempfile::tempdir().unwrap();
    let server = start_server(root.path()).await;
    let mut ws = connect(server.addr, "").await;

    let frame = next_frame(&mut ws).await.unwrap();
    assert_eq!(frame_type(&frame), "error");
    assert!(frame_data(&frame).contains("session"));
    assert!(next_frame(&mut ws).await.is_none());
    assert!(workspaces(root.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_query_is_rejected_with_error_frame() {
    let root = tempfile::tempdir().unwrap();
    let server = start_server(root.path()).await;
    let mut ws = connect(server.addr, "?session=a&session=b").await;

    let frame = next_frame(&mut ws).await.unwrap();
    assert_eq!(frame_type(&frame), "error");
    assert!(frame_data(&frame).contains("invalid query"));
    assert!(next_frame(&mut ws).await.is_none());
    assert!(workspaces(root.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_exit_sends_session_ended() {
    let root = tempfile::tempdir().unwrap();
    let server = start_server(root.path()).await;
    let mut ws = connect(server.addr, "?session=exits").await;

    let welcome = next_frame(&mut ws).await.unwrap();
    assert_eq!(frame_type(&welcome), "output");

    // Plain text is accepted as the literal command.
    ws.send(Message::Text("exit".into())).await.unwrap();

    let mut last = None;
    while let Some(frame) = next_frame(&mut ws).await {
        last = Some(frame);
    }
    let last = last.expect("no frames after exit");
    assert_eq!(frame_type(&last), "output");
    assert_eq!(frame_data(&last), cmux_shell::protocol::SESSION_ENDED);
    assert!(workspaces(root.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_input_reports_error_and_session_continues() {
    let root = tempfile::tempdir().unwrap();
    let server = start_server(root.path()).await;
    let mut ws = connect(server.addr, "?session=empty").await;
    next_frame(&mut ws).await.unwrap();

    ws.send(Message::Text(r#"{"input": ""}"#.into()))
        .await
        .unwrap();
    let mut saw_error = false;
    while !saw_error {
        let frame = next_frame(&mut ws).await.expect("connection closed early");
        saw_error = frame_type(&frame) == "error";
    }

    ws.send(Message::Text(r#"{"command": "echo still-$((1 + 1))"}"#.into()))
        .await
        .unwrap();
    let mut output = String::new();
    while !output.contains("still-2") {
        let frame = next_frame(&mut ws).await.expect("connection closed early");
        output.push_str(frame_data(&frame));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_live_session_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let server = start_server(root.path()).await;
    let mut first = connect(server.addr, "?session=dup").await;
    next_frame(&mut first).await.unwrap();

    let mut second = connect(server.addr, "?session=dup").await;
    let frame = next_frame(&mut second).await.unwrap();
    assert_eq!(frame_type(&frame), "error");
    assert!(next_frame(&mut second).await.is_none());
    assert_eq!(workspaces(root.path()).len(), 1);
}
