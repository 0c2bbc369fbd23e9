//! Supervisor lifecycle state machine
//!
//! Owns the single-active-model invariant: at most one child process, whose
//! `(state, preset)` pair is published as an atomic snapshot that readers
//! load without ever taking the mutator's lock. Only one mutating
//! operation (`run` or `kill`) is in flight at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{Catalog, CatalogEntry};
use crate::download::Downloader;
use crate::error::{Error, Result};
use crate::fsutil::{self, ModelsDir};
use crate::identifier::{self, Identifier, Kind};
use crate::paths;
use crate::preset::store::PresetStore;
use crate::preset::{ini, Mode, Preset};

use super::health;
use super::process::ServerProcess;

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Idle,
    Loading,
    Running,
}

/// One model reported by the router's `/models` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub id: String,
    pub status: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelStatus>,
}

/// Published view of the supervisor; replaced wholesale on transitions.
struct Snapshot {
    state: State,
    preset: Option<Arc<Preset>>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server_bin: PathBuf,
    pub models_dir: PathBuf,
    pub presets_dir: PathBuf,
    /// Where the generated router INI is written before a router start
    pub router_config_path: PathBuf,
    pub registry_url: String,
    pub ready_timeout: Duration,
    /// File the child's stdout/stderr are appended to; parent stdio when
    /// unset
    pub child_log: Option<PathBuf>,
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    /// Serializes `run`/`kill`; never taken by readers
    gate: tokio::sync::Mutex<()>,
    snapshot: ArcSwap<Snapshot>,
    process: ServerProcess,
    store: PresetStore,
    models: ModelsDir,
    downloader: Downloader,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Result<Self> {
        let store = PresetStore::new(&cfg.presets_dir)?;
        let models = ModelsDir::new(&cfg.models_dir)?;
        let downloader = Downloader::new(cfg.registry_url.clone(), models.clone())?;
        let process = ServerProcess::new(&cfg.server_bin);
        Ok(Self {
            cfg,
            gate: tokio::sync::Mutex::new(()),
            snapshot: ArcSwap::from_pointee(Snapshot {
                state: State::Idle,
                preset: None,
            }),
            process,
            store,
            models,
            downloader,
            http: reqwest::Client::new(),
        })
    }

    /// Make the identified model the running one.
    ///
    /// Stops any current child first; if that stop fails, the previous
    /// model keeps running and its state is restored. Returns the endpoint
    /// of the newly running server.
    pub async fn run(&self, token: &CancellationToken, raw_identifier: &str) -> Result<String> {
        let id = identifier::parse(raw_identifier)?;
        let _guard = self.gate.lock().await;

        let prev = self.snapshot.load_full();
        if self.process.is_running() {
            info!("stopping current model before switch");
            if let Err(e) = self.process.stop(token).await {
                warn!(error = %e, "failed to stop current model, keeping it");
                self.snapshot.store(prev);
                return Err(e);
            }
            let _ = std::fs::remove_file(&self.cfg.router_config_path);
        }
        self.publish(State::Idle, None);

        let preset = Arc::new(self.materialize(token, &id).await?);
        info!(preset = %preset.name, mode = %preset.mode, "loading model");
        self.publish(State::Loading, Some(preset.clone()));

        let args = match preset.mode {
            Mode::Router => {
                let ini = ini::generate_config_ini(&preset);
                if let Err(e) =
                    fsutil::atomic_write(&self.cfg.router_config_path, ini.as_bytes())
                {
                    self.publish(State::Idle, None);
                    return Err(e);
                }
                preset.build_router_args(&self.cfg.router_config_path)
            }
            Mode::Single => preset.build_args(),
        };

        let stdio = match self.child_stdio() {
            Ok(stdio) => stdio,
            Err(e) => {
                self.publish(State::Idle, None);
                return Err(e);
            }
        };
        if let Err(e) = self.process.start(&args, stdio) {
            self.publish(State::Idle, None);
            return Err(e);
        }

        let endpoint = preset.endpoint();
        if let Err(e) = self.wait_until_ready(token, &endpoint).await {
            // best-effort cleanup with a fresh token: the caller's may
            // already be cancelled
            let _ = self.process.stop(&CancellationToken::new()).await;
            let _ = std::fs::remove_file(&self.cfg.router_config_path);
            self.publish(State::Idle, None);
            return Err(e);
        }

        self.publish(State::Running, Some(preset.clone()));
        info!(preset = %preset.name, %endpoint, "model is running");
        Ok(endpoint)
    }

    /// Stop whatever is running. Idempotent: `kill` on an idle supervisor
    /// is a no-op.
    pub async fn kill(&self, token: &CancellationToken) -> Result<()> {
        let _guard = self.gate.lock().await;
        if self.snapshot.load().state == State::Idle {
            return Ok(());
        }
        let result = self.process.stop(token).await;
        let _ = std::fs::remove_file(&self.cfg.router_config_path);
        self.publish(State::Idle, None);
        result
    }

    /// Lock-free state read.
    pub fn state(&self) -> State {
        self.snapshot.load().state
    }

    /// Lock-free snapshot of the active preset.
    pub fn current_preset(&self) -> Option<Arc<Preset>> {
        self.snapshot.load().preset.clone()
    }

    pub fn list_presets(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    pub fn list_models(&self) -> Result<Vec<CatalogEntry>> {
        Ok(Catalog::load(self.models.root())?.list().to_vec())
    }

    /// Ask a running router child which models it currently serves.
    /// Returns `None` whenever the answer is unavailable (not running, not
    /// a router, transport or parse error) — this is a non-fatal probe.
    pub async fn fetch_model_statuses(
        &self,
        token: &CancellationToken,
    ) -> Option<Vec<ModelStatus>> {
        let snap = self.snapshot.load_full();
        if snap.state != State::Running {
            return None;
        }
        let preset = snap.preset.as_ref()?;
        if preset.mode != Mode::Router {
            return None;
        }

        let url = format!("{}/models", preset.endpoint());
        let send = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send();
        let response = tokio::select! {
            _ = token.cancelled() => return None,
            r = send => r.ok()?,
        };
        if response.status() != reqwest::StatusCode::OK {
            return None;
        }
        let parsed: ModelsResponse = response.json().await.ok()?;
        Some(parsed.data)
    }

    fn publish(&self, state: State, preset: Option<Arc<Preset>>) {
        self.snapshot.store(Arc::new(Snapshot { state, preset }));
    }

    fn child_stdio(&self) -> Result<Option<std::fs::File>> {
        match &self.cfg.child_log {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        Error::ProcessStart(format!(
                            "cannot open server log {}: {e}",
                            path.display()
                        ))
                    })?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    async fn wait_until_ready(&self, token: &CancellationToken, endpoint: &str) -> Result<()> {
        let done = self.process.done();
        tokio::select! {
            _ = done.cancelled() => {
                let detail = self
                    .process
                    .exit_err()
                    .unwrap_or_else(|| "clean early exit".to_string());
                Err(Error::ProcessWait(format!(
                    "server exited before becoming ready: {detail}"
                )))
            }
            result = tokio::time::timeout(
                self.cfg.ready_timeout,
                health::wait_for_ready(token, &self.http, endpoint),
            ) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::ProcessWait(format!(
                    "no healthy response from {endpoint} within {:?}",
                    self.cfg.ready_timeout
                ))),
            },
        }
    }

    /// Turn an identifier into a fully resolved preset: every `h:`
    /// reference becomes an `f:` path into the models directory,
    /// downloading the artifact first when the catalog lacks it.
    async fn materialize(&self, token: &CancellationToken, id: &Identifier) -> Result<Preset> {
        let preset = match &id.kind {
            Kind::Preset { name } => self.store.load_by_name(name)?,
            Kind::PresetFile { path } => self.store.load_file(path)?,
            Kind::ModelFile { path } => {
                let base = std::env::current_dir()?;
                let abs = paths::resolve(path, &base)?;
                synthetic_preset(&id.raw, &format!("f:{}", abs.display()))
            }
            Kind::HuggingFace { repo, quant } => {
                let path = self.ensure_artifact(token, repo, quant).await?;
                synthetic_preset(&id.raw, &format!("f:{}", path.display()))
            }
        };
        self.resolve_preset(token, &preset).await
    }

    /// Defensive copy: the input preset is never mutated, so concurrent
    /// readers of an already-published snapshot cannot observe a partially
    /// rewritten document.
    async fn resolve_preset(&self, token: &CancellationToken, preset: &Preset) -> Result<Preset> {
        let mut out = preset.clone();
        out.model = self.resolve_model_ref(token, &preset.model).await?;
        out.draft_model = self.resolve_model_ref(token, &preset.draft_model).await?;
        for entry in &mut out.models {
            entry.model = self.resolve_model_ref(token, &entry.model.clone()).await?;
            entry.draft_model = self
                .resolve_model_ref(token, &entry.draft_model.clone())
                .await?;
        }
        Ok(out)
    }

    async fn resolve_model_ref(&self, token: &CancellationToken, value: &str) -> Result<String> {
        if !value.starts_with("h:") {
            return Ok(value.to_string());
        }
        let id = identifier::parse(value)?;
        let Kind::HuggingFace { repo, quant } = &id.kind else {
            return Ok(value.to_string());
        };
        let path = self.ensure_artifact(token, repo, quant).await?;
        Ok(format!("f:{}", path.display()))
    }

    /// Path to the local artifact for `(repo, quant)`, downloading it when
    /// the catalog has no usable record.
    async fn ensure_artifact(
        &self,
        token: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<PathBuf> {
        if quant.is_empty() {
            return Err(Error::InvalidIdentifier(format!(
                "h:{repo} needs a quantization tag"
            )));
        }

        let mut catalog = Catalog::load(self.models.root())?;
        if catalog.exists(repo, quant) {
            let path = catalog.get_file_path(repo, quant)?;
            if path.exists() {
                return Ok(path);
            }
            // record without a file: drop it and re-download
            warn!(repo, quant, "catalog record has no file, re-downloading");
            catalog.remove(repo, quant);
        }

        info!(repo, quant, "model not downloaded yet, pulling from registry");
        self.downloader
            .pull(token, repo, quant, &mut catalog, None)
            .await?;
        catalog.get_file_path(repo, quant)
    }
}

/// Single-mode preset synthesized for a direct `h:`/`f:` model load. The
/// name is the identifier squeezed into the preset-name alphabet.
fn synthetic_preset(raw: &str, model: &str) -> Preset {
    Preset {
        name: sanitize_name(raw),
        model: model.to_string(),
        ..Default::default()
    }
}

fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "model".to_string()
    } else {
        trimmed.to_string()
    }
}
