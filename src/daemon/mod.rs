//! Daemon lifecycle plumbing
//!
//! Path helpers for the supervisor's state directory (control socket,
//! config, logs, models, presets) and file-based logging setup.

pub mod client;
pub mod config;
pub mod control;
pub mod health;
pub mod process;
pub mod supervisor;

pub use config::{load_config, save_config, DaemonConfig};
pub use control::{ControlServer, Request, Response};
pub use process::ServerProcess;
pub use supervisor::{State, Supervisor, SupervisorConfig};

use anyhow::Result;
use std::path::PathBuf;

/// State directory for the daemon: `<state_dir>/paddock`, falling back to
/// `~/.local/state/paddock` when the platform has no state directory.
pub fn state_dir() -> Result<PathBuf> {
    let base = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
        .ok_or_else(|| anyhow::anyhow!("could not determine state directory"))?;
    let dir = base.join("paddock");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Control socket path
pub fn socket_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("control.sock"))
}

/// Daemon config file path
pub fn config_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("config.toml"))
}

/// Router config path handed to the inference binary in router mode
pub fn router_config_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("router.ini"))
}

/// Log directory
pub fn logs_dir() -> Result<PathBuf> {
    let dir = state_dir()?.join("logs");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Default models directory
pub fn default_models_dir() -> Result<PathBuf> {
    Ok(state_dir()?.join("models"))
}

/// Default presets directory
pub fn default_presets_dir() -> Result<PathBuf> {
    Ok(state_dir()?.join("presets"))
}

/// Initialize daemon logging: env-filtered stderr plus a daily-rolling file
/// under the log directory. The returned guard must be held for the
/// daemon's lifetime so buffered lines are flushed.
pub fn init_logging(level: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::daily(logs_dir()?, "paddock.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}
