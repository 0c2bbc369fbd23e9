//! Readiness probing
//!
//! Polls the child's `/health` endpoint until it answers 200. Transport
//! errors and non-200 responses just mean "not yet"; the caller bounds the
//! wait through the cancellation token or an outer timeout.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

const PROBE_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait until `GET <endpoint>/health` returns 200.
pub async fn wait_for_ready(
    token: &CancellationToken,
    client: &reqwest::Client,
    endpoint: &str,
) -> Result<()> {
    let url = format!("{endpoint}/health");
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempt += 1;

        let request = client.get(&url).timeout(PROBE_TIMEOUT).send();
        let ready = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            r = request => match r {
                Ok(response) => response.status() == reqwest::StatusCode::OK,
                Err(e) => {
                    trace!(attempt, error = %e, "health probe failed");
                    false
                }
            },
        };
        if ready {
            debug!(attempt, %url, "server is ready");
            return Ok(());
        }

        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP responder: answers every request with the given status.
    async fn serve_status(listener: TcpListener, status: &'static str) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }

    #[tokio::test]
    async fn returns_once_health_is_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve_status(listener, "200 OK"));

        let token = CancellationToken::new();
        wait_for_ready(&token, &reqwest::Client::new(), &endpoint)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve_status(listener, "503 Service Unavailable"));

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        assert!(matches!(
            wait_for_ready(&token, &reqwest::Client::new(), &endpoint).await,
            Err(Error::Cancelled)
        ));
    }
}
