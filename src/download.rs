//! Resumable artifact downloads
//!
//! Fetches one GGUF artifact identified by `(repo, quant)` from a
//! HuggingFace-compatible registry: manifest first, then a ranged download
//! into `<filename>.part` with the validator saved to `<filename>.etag`,
//! finished with fsync + rename and a mandatory SHA-256 check against the
//! manifest. Verification is fail-closed: a missing or mismatched hash
//! deletes the file.
//!
//! All filesystem access goes through the confined [`ModelsDir`] handle;
//! the filename the registry returns is never joined naively.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::TryStreamExt;
use reqwest::header;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogEntry};
use crate::error::{Error, Result};
use crate::fsutil::ModelsDir;

pub const DEFAULT_REGISTRY_URL: &str = "https://huggingface.co";

/// The registry only serves GGUF metadata to clients that identify as
/// llama-cpp.
const MANIFEST_USER_AGENT: &str = "llama-cpp";

/// Body bytes are copied to disk in chunks of at most this size; progress
/// callbacks fire once per chunk.
const CHUNK_SIZE: usize = 32 * 1024;

/// Progress callback: `(downloaded_bytes, total_bytes)`; total is `-1` when
/// the server did not advertise a length.
pub type ProgressFn = dyn Fn(u64, i64) + Send + Sync;

/// What the manifest says about an artifact
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub filename: String,
    pub size: u64,
    /// Hex SHA-256 from the LFS pointer; may be empty (fails verification)
    pub sha256: String,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(rename = "ggufFile")]
    gguf_file: Option<GgufFile>,
}

#[derive(Deserialize, Default)]
struct GgufFile {
    #[serde(default)]
    rfilename: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    lfs: Lfs,
}

#[derive(Deserialize, Default)]
struct Lfs {
    #[serde(default)]
    sha256: String,
}

/// Outcome of one download attempt: finished, or "discard resume state and
/// try again" (bounded at one retry).
enum Attempt {
    Done,
    Retry,
}

pub struct Downloader {
    base_url: String,
    client: reqwest::Client,
    models: ModelsDir,
}

impl Downloader {
    pub fn new(base_url: impl Into<String>, models: ModelsDir) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Other(format!("cannot build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            models,
        })
    }

    pub fn models(&self) -> &ModelsDir {
        &self.models
    }

    /// Fetch the registry manifest for `(repo, quant)`.
    pub async fn fetch_manifest(
        &self,
        token: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<ArtifactInfo> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, quant);
        debug!(%url, "fetching manifest");

        let send = self
            .client
            .get(&url)
            .header(header::USER_AGENT, MANIFEST_USER_AGENT)
            .header(header::ACCEPT, "application/json")
            .send();
        let response = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            r = send => r.map_err(|e| Error::Download(e.to_string()))?,
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => {
                return Err(Error::RepositoryNotFound(repo.to_string()))
            }
            StatusCode::BAD_REQUEST => {
                return Err(Error::InvalidQuantization {
                    repo: repo.to_string(),
                    quant: quant.to_string(),
                })
            }
            status => return Err(Error::Manifest(status.as_u16())),
        }

        let manifest: Manifest = response
            .json()
            .await
            .map_err(|e| Error::Download(format!("malformed manifest: {e}")))?;
        let gguf = manifest
            .gguf_file
            .ok_or_else(|| Error::Download("manifest has no ggufFile".to_string()))?;
        if gguf.rfilename.is_empty() {
            return Err(Error::Download("manifest has no filename".to_string()));
        }

        Ok(ArtifactInfo {
            filename: gguf.rfilename,
            size: gguf.size,
            sha256: gguf.lfs.sha256,
        })
    }

    /// Download, verify, and record one artifact. Returns the catalog entry
    /// written on success.
    pub async fn pull(
        &self,
        token: &CancellationToken,
        repo: &str,
        quant: &str,
        catalog: &mut Catalog,
        progress: Option<&ProgressFn>,
    ) -> Result<CatalogEntry> {
        let info = self.fetch_manifest(token, repo, quant).await?;
        info!(repo, quant, filename = %info.filename, size = info.size, "pulling artifact");

        let final_path = self.download(token, repo, &info, progress).await?;
        self.verify(&final_path, &info.sha256).await?;

        let size = tokio::fs::metadata(&final_path)
            .await
            .map(|m| m.len())
            .unwrap_or(info.size);
        let entry = CatalogEntry {
            repo: repo.to_string(),
            quant: quant.to_string(),
            filename: info.filename.clone(),
            size,
            downloaded_at: Utc::now(),
        };
        catalog.add(entry.clone());
        catalog.save()?;
        info!(repo, quant, "artifact recorded in catalog");
        Ok(entry)
    }

    /// Fetch the artifact body, resuming a previous partial transfer when
    /// the saved validator still matches. Returns the final file path.
    async fn download(
        &self,
        token: &CancellationToken,
        repo: &str,
        info: &ArtifactInfo,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        let final_path = self.models.join(&info.filename)?;
        let part_path = self.models.join(&format!("{}.part", info.filename))?;
        let etag_path = self.models.join(&format!("{}.etag", info.filename))?;
        let url = format!(
            "{}/{}/resolve/main/{}",
            self.base_url, repo, info.filename
        );

        let mut retried = false;
        loop {
            match self
                .attempt(token, &url, &final_path, &part_path, &etag_path, progress)
                .await?
            {
                Attempt::Done => return Ok(final_path),
                Attempt::Retry if !retried => {
                    retried = true;
                    debug!(%url, "restarting download from byte 0");
                }
                Attempt::Retry => {
                    return Err(Error::Download(
                        "server kept rejecting the resume request".to_string(),
                    ))
                }
            }
        }
    }

    async fn attempt(
        &self,
        token: &CancellationToken,
        url: &str,
        final_path: &Path,
        part_path: &Path,
        etag_path: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<Attempt> {
        let mut existing = tokio::fs::metadata(part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let etag = match tokio::fs::read_to_string(etag_path).await {
            Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        };

        // a partial file without a saved validator cannot be resumed safely
        if existing > 0 && etag.is_none() {
            debug!(part = %part_path.display(), "partial file without validator, discarding");
            discard_resume_state(part_path, etag_path).await;
            existing = 0;
        }

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request
                .header(header::RANGE, format!("bytes={existing}-"))
                .header(header::IF_RANGE, etag.clone().unwrap_or_default());
            debug!(existing, "resuming download");
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            r = request.send() => r.map_err(|e| Error::Download(e.to_string()))?,
        };

        let total: i64;
        let append: bool;
        match response.status() {
            StatusCode::OK => {
                // server ignored the range or the validator no longer
                // matches: start over
                if existing > 0 {
                    discard_resume_state(part_path, etag_path).await;
                    existing = 0;
                }
                total = response.content_length().map(|l| l as i64).unwrap_or(-1);
                append = false;
                match response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                {
                    Some(tag) => tokio::fs::write(etag_path, tag).await?,
                    None => {
                        let _ = tokio::fs::remove_file(etag_path).await;
                    }
                }
            }
            StatusCode::PARTIAL_CONTENT => {
                let start = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_start);
                if start != Some(existing) {
                    warn!(?start, existing, "content-range does not match partial file");
                    discard_resume_state(part_path, etag_path).await;
                    return Ok(Attempt::Retry);
                }
                total = response
                    .content_length()
                    .map(|l| (existing + l) as i64)
                    .unwrap_or(-1);
                append = true;
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                discard_resume_state(part_path, etag_path).await;
                return Ok(Attempt::Retry);
            }
            status => {
                return Err(Error::Download(format!(
                    "unexpected download status {status}"
                )))
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(part_path)
            .await?;

        let mut written = existing;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut body = StreamReader::new(stream);
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = tokio::select! {
                _ = token.cancelled() => {
                    // keep .part and .etag so the next attempt resumes
                    let _ = file.flush().await;
                    return Err(Error::Cancelled);
                }
                read = body.read(&mut buf) => {
                    read.map_err(|e| Error::Download(e.to_string()))?
                }
            };
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
            if let Some(cb) = progress {
                cb(written, total);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(part_path, final_path).await?;
        let _ = tokio::fs::remove_file(etag_path).await;
        debug!(written, path = %final_path.display(), "download complete");
        Ok(Attempt::Done)
    }

    /// Compare the file's SHA-256 with the manifest hash. Deletes the file
    /// on a missing or mismatched hash.
    async fn verify(&self, path: &Path, expected: &str) -> Result<()> {
        if expected.is_empty() {
            let _ = tokio::fs::remove_file(path).await;
            return Err(Error::Integrity {
                expected: "<missing from manifest>".to_string(),
                actual: "<not checked>".to_string(),
            });
        }

        let actual = hash_file(path.to_path_buf()).await?;
        if !actual.eq_ignore_ascii_case(expected) {
            warn!(path = %path.display(), expected, actual, "integrity check failed");
            let _ = tokio::fs::remove_file(path).await;
            return Err(Error::Integrity {
                expected: expected.to_string(),
                actual,
            });
        }
        debug!(path = %path.display(), "integrity verified");
        Ok(())
    }
}

/// Hex SHA-256 of a file, computed off the async runtime.
async fn hash_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Other(format!("hash task failed: {e}")))?
}

async fn discard_resume_state(part_path: &Path, etag_path: &Path) {
    let _ = tokio::fs::remove_file(part_path).await;
    let _ = tokio::fs::remove_file(etag_path).await;
}

/// Parse the start offset out of `Content-Range: bytes <start>-<end>/<total>`.
fn parse_content_range_start(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes ")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}
