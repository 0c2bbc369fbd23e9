//! paddock — local supervisor for a GGUF inference server
//!
//! Resolves stable model identifiers (`p:`, `h:`, `f:`) to on-disk
//! artifacts, launches the inference binary, enforces a single-active-model
//! invariant, serves a newline-JSON control protocol over a Unix socket,
//! and downloads missing artifacts with resumable, SHA-256-verified
//! transfers.

pub mod catalog;
pub mod cli;
pub mod daemon;
pub mod download;
pub mod error;
pub mod fsutil;
pub mod identifier;
pub mod paths;
pub mod preset;

pub use catalog::{Catalog, CatalogEntry};
pub use daemon::{
    ControlServer, DaemonConfig, Request, Response, ServerProcess, State, Supervisor,
    SupervisorConfig,
};
pub use download::{Downloader, DEFAULT_REGISTRY_URL};
pub use error::{Error, Result};
pub use fsutil::ModelsDir;
pub use identifier::{Identifier, Kind};
pub use preset::store::PresetStore;
pub use preset::{Mode, Preset};
