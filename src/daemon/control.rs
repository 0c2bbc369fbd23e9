//! Control-plane server
//!
//! Newline-delimited JSON over a Unix-domain socket. One request per
//! connection: the server reads a single frame, replies with a single
//! frame, and closes. Clients that disconnect without sending anything are
//! tolerated; malformed frames are logged and dropped, never answered with
//! a protocol error of their own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::preset::Mode;

use super::supervisor::{State, Supervisor};

/// Request envelope: `{"command": "...", "args": {...}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Value::Null,
        }
    }

    pub fn with_args(command: impl Into<String>, args: Value) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

/// Response envelope: `{"status": "ok"|"error", ...}`
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(message.into()),
            error_code: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(err.to_string()),
            error_code: err.code().map(str::to_string),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

pub struct ControlServer {
    supervisor: Arc<Supervisor>,
    socket_path: PathBuf,
}

impl ControlServer {
    pub fn new(supervisor: Arc<Supervisor>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            supervisor,
            socket_path: socket_path.into(),
        }
    }

    /// Bind the socket and accept connections until the token fires.
    ///
    /// Any stale socket file is unlinked before binding; permissions are
    /// tightened to owner-only. The socket file itself is left for the
    /// daemon's shutdown path to remove.
    pub async fn serve(&self, token: CancellationToken) -> Result<()> {
        if self.socket_path.exists() {
            debug!(path = %self.socket_path.display(), "removing stale control socket");
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.socket_path,
                std::fs::Permissions::from_mode(0o600),
            )?;
        }
        info!(path = %self.socket_path.display(), "control server listening");

        loop {
            let stream = tokio::select! {
                _ = token.cancelled() => {
                    info!("control server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let supervisor = self.supervisor.clone();
            let conn_token = token.clone();
            tokio::spawn(async move {
                handle_connection(supervisor, stream, conn_token).await;
            });
        }
    }
}

async fn handle_connection(
    supervisor: Arc<Supervisor>,
    stream: UnixStream,
    token: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        // client connected and went away without a request
        Ok(0) => return,
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "failed to read control request");
            return;
        }
    }

    let request: Request = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, frame = %line.trim(), "malformed control frame");
            return;
        }
    };

    debug!(command = %request.command, "control request");
    let response = dispatch(&supervisor, &token, request).await;

    let mut payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "cannot serialize control response");
            return;
        }
    };
    payload.push(b'\n');
    if let Err(e) = writer.write_all(&payload).await {
        debug!(error = %e, "client went away before the response");
    }
}

async fn dispatch(
    supervisor: &Supervisor,
    token: &CancellationToken,
    request: Request,
) -> Response {
    match request.command.as_str() {
        "status" => status(supervisor, token).await,
        "load" => {
            let Some(identifier) = request.args.get("identifier").and_then(Value::as_str)
            else {
                return Response::error("load requires an identifier argument");
            };
            match supervisor.run(token, identifier).await {
                Ok(endpoint) => Response::ok(json!({ "endpoint": endpoint })),
                Err(e) => Response::from_error(&e),
            }
        }
        "unload" => match supervisor.kill(token).await {
            Ok(()) => Response::ok(json!({})),
            Err(e) => Response::from_error(&e),
        },
        "list_presets" => match supervisor.list_presets() {
            Ok(presets) => Response::ok(json!({ "presets": presets })),
            Err(e) => Response::from_error(&e),
        },
        "list_models" => match supervisor.list_models() {
            Ok(models) => Response::ok(json!({ "models": models })),
            Err(e) => Response::from_error(&e),
        },
        _ => Response::error("unknown command"),
    }
}

async fn status(supervisor: &Supervisor, token: &CancellationToken) -> Response {
    let state = supervisor.state();
    let mut data = json!({ "state": state });

    if let Some(preset) = supervisor.current_preset() {
        data["preset"] = json!(preset.name);
        data["endpoint"] = json!(preset.endpoint());
        data["mode"] = json!(preset.mode.to_string());
        match preset.mode {
            Mode::Single => {
                if !preset.mmproj.is_empty() && preset.mmproj != "none" {
                    data["mmproj"] = json!(preset.mmproj);
                }
            }
            Mode::Router => {
                // live statuses when the child answers, declared names
                // otherwise
                let live = if state == State::Running {
                    supervisor.fetch_model_statuses(token).await
                } else {
                    None
                };
                data["models"] = match live {
                    Some(statuses) => json!(statuses),
                    None => json!(preset
                        .models
                        .iter()
                        .map(|m| json!({ "id": m.name, "status": "unknown" }))
                        .collect::<Vec<_>>()),
                };
            }
        }
    }
    Response::ok(data)
}

/// Remove the control socket file; called by the daemon on shutdown.
pub fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove control socket");
        }
    }
}
