//! Control-socket protocol tests: framing, dispatch, and error codes, end
//! to end through a real Unix socket.

#![cfg(unix)]

mod common;

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use common::{build_supervisor, spawn_model_endpoint, store_single_preset, Fixture};
use paddock::daemon::client;
use paddock::{ControlServer, Error, Request};

struct Daemon {
    fixture: Fixture,
    socket: PathBuf,
    token: CancellationToken,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn start_daemon() -> Daemon {
    let fixture = build_supervisor(tempfile::tempdir().unwrap());
    let socket = fixture.dir.path().join("control.sock");
    let token = CancellationToken::new();

    let server = ControlServer::new(fixture.supervisor.clone(), &socket);
    let serve_token = token.clone();
    tokio::spawn(async move {
        let _ = server.serve(serve_token).await;
    });

    // wait for the socket to appear
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Daemon {
        fixture,
        socket,
        token,
    }
}

#[tokio::test]
async fn status_on_idle_daemon() {
    let daemon = start_daemon().await;
    let response = client::request(&daemon.socket, Request::new("status"))
        .await
        .unwrap();
    assert!(response.is_ok());
    let data = response.data.unwrap();
    assert_eq!(data["state"], "idle");
    assert!(data.get("preset").is_none());
}

#[tokio::test]
async fn load_and_status_happy_path() {
    let endpoint = spawn_model_endpoint(None).await;
    let daemon = start_daemon().await;
    store_single_preset(&daemon.fixture, "test", endpoint.port());

    let response = client::request(
        &daemon.socket,
        Request::with_args("load", json!({ "identifier": "p:test" })),
    )
    .await
    .unwrap();
    assert!(response.is_ok(), "load failed: {:?}", response.error);
    let expected = format!("http://127.0.0.1:{}", endpoint.port());
    assert_eq!(response.data.unwrap()["endpoint"], expected);

    let status = client::request(&daemon.socket, Request::new("status"))
        .await
        .unwrap();
    let data = status.data.unwrap();
    assert_eq!(data["state"], "running");
    assert_eq!(data["preset"], "test");
    assert_eq!(data["endpoint"], expected);
    assert_eq!(data["mode"], "single");

    let unload = client::request(&daemon.socket, Request::new("unload"))
        .await
        .unwrap();
    assert!(unload.is_ok());

    let status = client::request(&daemon.socket, Request::new("status"))
        .await
        .unwrap();
    assert_eq!(status.data.unwrap()["state"], "idle");
}

#[tokio::test]
async fn load_unknown_preset_returns_stable_code() {
    let daemon = start_daemon().await;
    let response = client::request(
        &daemon.socket,
        Request::with_args("load", json!({ "identifier": "p:nope" })),
    )
    .await
    .unwrap();
    assert_eq!(response.status, "error");
    assert_eq!(response.error_code.as_deref(), Some("preset-not-found"));

    // the failed load left the supervisor idle
    let status = client::request(&daemon.socket, Request::new("status"))
        .await
        .unwrap();
    assert_eq!(status.data.unwrap()["state"], "idle");
}

#[tokio::test]
async fn load_without_identifier_is_an_error() {
    let daemon = start_daemon().await;
    let response = client::request(&daemon.socket, Request::new("load"))
        .await
        .unwrap();
    assert_eq!(response.status, "error");
    assert!(response.error_code.is_none());
}

#[tokio::test]
async fn unknown_command_has_no_code() {
    let daemon = start_daemon().await;
    let response = client::request(&daemon.socket, Request::new("selfdestruct"))
        .await
        .unwrap();
    assert_eq!(response.status, "error");
    assert_eq!(response.error.as_deref(), Some("unknown command"));
    assert!(response.error_code.is_none());
}

#[tokio::test]
async fn list_presets_and_models_round_trip() {
    let daemon = start_daemon().await;
    store_single_preset(&daemon.fixture, "alpha", 8080);
    store_single_preset(&daemon.fixture, "beta", 8080);

    let response = client::request(&daemon.socket, Request::new("list_presets"))
        .await
        .unwrap();
    assert_eq!(
        response.data.unwrap()["presets"],
        json!(["alpha", "beta"])
    );

    let response = client::request(&daemon.socket, Request::new("list_models"))
        .await
        .unwrap();
    assert_eq!(response.data.unwrap()["models"], json!([]));
}

#[tokio::test]
async fn disconnect_without_request_is_tolerated() {
    let daemon = start_daemon().await;
    // connect and immediately hang up
    let stream = UnixStream::connect(&daemon.socket).await.unwrap();
    drop(stream);

    // the server keeps serving
    let response = client::request(&daemon.socket, Request::new("status"))
        .await
        .unwrap();
    assert!(response.is_ok());
}

#[tokio::test]
async fn malformed_frame_is_dropped_not_answered() {
    let daemon = start_daemon().await;
    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();

    let (reader, _writer) = stream.split();
    let mut line = String::new();
    let n = BufReader::new(reader).read_line(&mut line).await.unwrap();
    assert_eq!(n, 0, "server should close without replying, got {line:?}");

    // and the next client is unaffected
    let response = client::request(&daemon.socket, Request::new("status"))
        .await
        .unwrap();
    assert!(response.is_ok());
}

#[tokio::test]
async fn socket_permissions_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;
    let daemon = start_daemon().await;
    let mode = std::fs::metadata(&daemon.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn missing_socket_means_daemon_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let result = client::request(&dir.path().join("nope.sock"), Request::new("status")).await;
    assert!(matches!(result, Err(Error::DaemonUnreachable)));
}
