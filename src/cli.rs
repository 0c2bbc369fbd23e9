//! Thin CLI commands
//!
//! Everything here is a wrapper over the control socket (or, for `pull`,
//! the downloader directly). Exit codes are part of the contract with
//! scripts: 0 success, 1 generic error, 2 daemon not running, 3 preset not
//! found, 4 model not found, 5 download failed.

use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::catalog::Catalog;
use crate::daemon::control::{remove_socket, Request, Response};
use crate::daemon::{self, client, ControlServer, Supervisor, SupervisorConfig};
use crate::download::Downloader;
use crate::error::Error;
use crate::fsutil::ModelsDir;
use crate::identifier::{self, Kind};

pub const EXIT_OK: i32 = 0;
pub const EXIT_GENERIC: i32 = 1;
pub const EXIT_DAEMON_NOT_RUNNING: i32 = 2;
pub const EXIT_PRESET_NOT_FOUND: i32 = 3;
pub const EXIT_MODEL_NOT_FOUND: i32 = 4;
pub const EXIT_DOWNLOAD_FAILED: i32 = 5;

fn exit_code_for(code: Option<&str>) -> i32 {
    match code {
        Some("preset-not-found") => EXIT_PRESET_NOT_FOUND,
        Some("model-not-found") => EXIT_MODEL_NOT_FOUND,
        Some("download-failed") => EXIT_DOWNLOAD_FAILED,
        _ => EXIT_GENERIC,
    }
}

fn report(response: Response, on_ok: impl FnOnce(&Response)) -> i32 {
    if response.is_ok() {
        on_ok(&response);
        EXIT_OK
    } else {
        eprintln!(
            "error: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
        exit_code_for(response.error_code.as_deref())
    }
}

async fn send(request: Request) -> std::result::Result<Response, i32> {
    let socket = match daemon::socket_path() {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("error: {e}");
            return Err(EXIT_GENERIC);
        }
    };
    match client::request(&socket, request).await {
        Ok(response) => Ok(response),
        Err(Error::DaemonUnreachable) => {
            eprintln!("error: daemon is not running (start it with `paddock daemon`)");
            Err(EXIT_DAEMON_NOT_RUNNING)
        }
        Err(e) => {
            eprintln!("error: {e}");
            Err(EXIT_GENERIC)
        }
    }
}

/// Run the supervisor daemon in the foreground until Ctrl+C or SIGTERM.
pub async fn run_daemon() -> Result<()> {
    let config = daemon::load_config()?;
    let _log_guard = daemon::init_logging(&config.log_level)?;

    let sup_config = SupervisorConfig {
        server_bin: config.server_bin.clone(),
        models_dir: config.models_dir()?,
        presets_dir: config.presets_dir()?,
        router_config_path: daemon::router_config_path()?,
        registry_url: config.registry_url.clone(),
        ready_timeout: std::time::Duration::from_secs(config.ready_timeout_secs),
        child_log: Some(daemon::logs_dir()?.join("server.log")),
    };
    let supervisor =
        Arc::new(Supervisor::new(sup_config).context("cannot initialize supervisor")?);

    let socket = daemon::socket_path()?;
    let server = ControlServer::new(supervisor.clone(), &socket);

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let result = server.serve(token).await;

    // stop whatever is running before the process goes away
    let _ = supervisor.kill(&CancellationToken::new()).await;
    remove_socket(&socket);
    result.map_err(Into::into)
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C signal");
        },
        _ = terminate => {
            info!("received terminate signal");
        },
    }
}

pub async fn load(identifier: &str) -> i32 {
    let request = Request::with_args("load", json!({ "identifier": identifier }));
    match send(request).await {
        Ok(response) => report(response, |r| {
            let endpoint = r
                .data
                .as_ref()
                .and_then(|d| d.get("endpoint"))
                .and_then(|e| e.as_str())
                .unwrap_or_default();
            println!("model loaded, serving at {endpoint}");
        }),
        Err(code) => code,
    }
}

pub async fn unload() -> i32 {
    match send(Request::new("unload")).await {
        Ok(response) => report(response, |_| println!("model unloaded")),
        Err(code) => code,
    }
}

pub async fn status() -> i32 {
    match send(Request::new("status")).await {
        Ok(response) => report(response, |r| {
            let Some(data) = r.data.as_ref() else {
                return;
            };
            let state = data["state"].as_str().unwrap_or("unknown");
            println!("state: {state}");
            if let Some(preset) = data["preset"].as_str() {
                println!("preset: {preset}");
            }
            if let Some(endpoint) = data["endpoint"].as_str() {
                println!("endpoint: {endpoint}");
            }
            if let Some(mode) = data["mode"].as_str() {
                println!("mode: {mode}");
            }
            if let Some(mmproj) = data["mmproj"].as_str() {
                println!("mmproj: {mmproj}");
            }
            if let Some(models) = data["models"].as_array() {
                println!("models:");
                for model in models {
                    println!(
                        "  {} ({})",
                        model["id"].as_str().unwrap_or("?"),
                        model["status"].as_str().unwrap_or("unknown")
                    );
                }
            }
        }),
        Err(code) => code,
    }
}

pub async fn list_presets() -> i32 {
    match send(Request::new("list_presets")).await {
        Ok(response) => report(response, |r| {
            let presets = r
                .data
                .as_ref()
                .and_then(|d| d["presets"].as_array())
                .cloned()
                .unwrap_or_default();
            if presets.is_empty() {
                println!("no presets");
            }
            for preset in presets {
                println!("{}", preset.as_str().unwrap_or("?"));
            }
        }),
        Err(code) => code,
    }
}

pub async fn list_models() -> i32 {
    match send(Request::new("list_models")).await {
        Ok(response) => report(response, |r| {
            let models = r
                .data
                .as_ref()
                .and_then(|d| d["models"].as_array())
                .cloned()
                .unwrap_or_default();
            if models.is_empty() {
                println!("no models downloaded");
            }
            for model in models {
                println!(
                    "{}:{}  {}  {} bytes",
                    model["repo"].as_str().unwrap_or("?"),
                    model["quant"].as_str().unwrap_or("?"),
                    model["filename"].as_str().unwrap_or("?"),
                    model["size"].as_u64().unwrap_or(0)
                );
            }
        }),
        Err(code) => code,
    }
}

/// Download a model directly, without going through the daemon.
pub async fn pull(identifier: &str) -> i32 {
    let parsed = match identifier::parse(identifier) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_GENERIC;
        }
    };
    let Kind::HuggingFace { repo, quant } = parsed.kind else {
        eprintln!("error: pull takes an h:<repo>:<quant> identifier");
        return EXIT_GENERIC;
    };
    if quant.is_empty() {
        eprintln!("error: pull needs a quantization tag (h:{repo}:<quant>)");
        return EXIT_GENERIC;
    }

    match pull_inner(&repo, &quant).await {
        Ok(path) => {
            println!("downloaded to {path}");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for(e.code())
        }
    }
}

async fn pull_inner(repo: &str, quant: &str) -> crate::error::Result<String> {
    let config = daemon::load_config().map_err(|e| Error::Other(e.to_string()))?;
    let models_dir = config.models_dir().map_err(|e| Error::Other(e.to_string()))?;
    let models = ModelsDir::new(&models_dir)?;
    let downloader = Downloader::new(config.registry_url.clone(), models.clone())?;
    let mut catalog = Catalog::load(&models_dir)?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    let progress_bar = bar.clone();
    let progress = move |downloaded: u64, total: i64| {
        if total >= 0 {
            progress_bar.set_length(total as u64);
        }
        progress_bar.set_position(downloaded);
    };

    let token = CancellationToken::new();
    let entry = downloader
        .pull(&token, repo, quant, &mut catalog, Some(&progress))
        .await?;
    bar.finish_and_clear();

    Ok(models.join(&entry.filename)?.display().to_string())
}
