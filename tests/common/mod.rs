//! Shared fixtures for integration tests: a stub inference binary, a fake
//! model-server HTTP endpoint, and supervisor construction over tempdirs.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use paddock::preset::store::PresetStore;
use paddock::preset::{ModelEntry, Preset};
use paddock::{Supervisor, SupervisorConfig};

/// Write a stand-in for the inference binary: accepts any arguments and
/// stays alive until signalled.
pub fn write_stub_server(dir: &Path) -> PathBuf {
    let path = dir.join("stub-server.sh");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Serve `/health` (200) and `/models` (router payload) on a local port,
/// optionally delaying each response.
pub async fn spawn_model_endpoint(delay: Option<Duration>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let mut buf = vec![0u8; 2048];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let body = if request.starts_with("GET /models") {
                    r#"{"data":[{"id":"codellama","status":"loaded"},{"id":"mistral","status":"idle"}]}"#
                } else {
                    ""
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

/// Everything a supervisor test needs, rooted in one tempdir.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub supervisor: Arc<Supervisor>,
    pub models_dir: PathBuf,
    pub presets_dir: PathBuf,
    pub router_config: PathBuf,
}

pub fn build_supervisor(dir: tempfile::TempDir) -> Fixture {
    let models_dir = dir.path().join("models");
    let presets_dir = dir.path().join("presets");
    let router_config = dir.path().join("router.ini");
    let server_bin = write_stub_server(dir.path());

    let supervisor = Supervisor::new(SupervisorConfig {
        server_bin,
        models_dir: models_dir.clone(),
        presets_dir: presets_dir.clone(),
        router_config_path: router_config.clone(),
        registry_url: "http://127.0.0.1:9".to_string(),
        ready_timeout: Duration::from_secs(10),
        child_log: None,
    })
    .unwrap();

    Fixture {
        dir,
        supervisor: Arc::new(supervisor),
        models_dir,
        presets_dir,
        router_config,
    }
}

pub fn store_single_preset(fixture: &Fixture, name: &str, port: u16) {
    let model_path = fixture.dir.path().join(format!("{name}.gguf"));
    std::fs::write(&model_path, b"gguf").unwrap();
    let preset = Preset {
        name: name.to_string(),
        model: format!("f:{}", model_path.display()),
        host: "127.0.0.1".to_string(),
        port,
        ..Default::default()
    };
    PresetStore::new(&fixture.presets_dir)
        .unwrap()
        .save(&preset)
        .unwrap();
}

pub fn store_router_preset(fixture: &Fixture, name: &str, port: u16) {
    let preset = Preset {
        name: name.to_string(),
        mode: paddock::Mode::Router,
        host: "127.0.0.1".to_string(),
        port,
        models: vec![
            ModelEntry {
                name: "codellama".to_string(),
                model: "f:/models/codellama.gguf".to_string(),
                ..Default::default()
            },
            ModelEntry {
                name: "mistral".to_string(),
                model: "f:/models/mistral.gguf".to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    PresetStore::new(&fixture.presets_dir)
        .unwrap()
        .save(&preset)
        .unwrap();
}
