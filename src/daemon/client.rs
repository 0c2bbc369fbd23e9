//! Control-socket client
//!
//! Used by the CLI to talk to a running daemon: connect, send one
//! newline-framed JSON request, read the single response, done. A missing
//! or refusing socket means the daemon is not running.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{Error, Result};

use super::control::{Request, Response};

/// Send one request to the daemon and return its response.
pub async fn request(socket_path: &Path, request: Request) -> Result<Response> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|_| Error::DaemonUnreachable)?;
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_vec(&request)
        .map_err(|e| Error::Other(format!("cannot encode request: {e}")))?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|_| Error::DaemonUnreachable)?;

    let mut line = String::new();
    let mut reader = BufReader::new(reader);
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|_| Error::DaemonUnreachable)?;
    if n == 0 {
        return Err(Error::DaemonUnreachable);
    }

    serde_json::from_str(line.trim())
        .map_err(|e| Error::Other(format!("malformed daemon response: {e}")))
}
