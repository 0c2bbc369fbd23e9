//! Error types shared across the supervisor
//!
//! Components return `Error` directly; the control server maps variants to
//! stable string codes so clients can handle failures programmatically while
//! still seeing the raw message.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the supervisor and its subsystems
#[derive(Error, Debug)]
pub enum Error {
    /// The identifier string was empty
    #[error("empty identifier")]
    EmptyIdentifier,

    /// The identifier did not have the `<prefix>:<rest>` shape
    #[error("invalid identifier format: {0:?}")]
    InvalidIdentifier(String),

    /// The identifier prefix is not one of `p`, `h`, `f`
    #[error("unknown identifier prefix in {0:?}")]
    UnknownPrefix(String),

    /// A preset document failed schema validation
    #[error("invalid preset field `{field}`: {reason}")]
    PresetInvalid { field: String, reason: String },

    /// No preset with the requested name exists on disk
    #[error("preset not found: {0}")]
    PresetNotFound(String),

    /// `(repo, quant)` is not present in the local catalog
    #[error("model not found: {repo}:{quant}")]
    ModelNotFound { repo: String, quant: String },

    /// The registry does not know the repository (404/401 on the manifest)
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// The registry rejected the quantization tag (400 on the manifest)
    #[error("invalid quantization {quant:?} for {repo}")]
    InvalidQuantization { repo: String, quant: String },

    /// The manifest request failed with an unexpected status
    #[error("manifest request failed with status {0}")]
    Manifest(u16),

    /// A network or protocol error during the artifact download
    #[error("download failed: {0}")]
    Download(String),

    /// The downloaded file's SHA-256 did not match the manifest
    ///
    /// The file has already been deleted when this is returned.
    #[error("integrity check failed: expected sha256 {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// `start` was called while a child process is live
    #[error("server process is already running")]
    AlreadyRunning,

    /// Spawning the inference binary failed
    #[error("failed to start server process: {0}")]
    ProcessStart(String),

    /// The readiness probe timed out or the child exited early
    #[error("server never became ready: {0}")]
    ProcessWait(String),

    /// Client-side: the control socket refused or is absent
    #[error("daemon is not running")]
    DaemonUnreachable,

    /// The operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all carrying the raw message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable string code for programmatic handling over the control socket.
    ///
    /// Returns `None` for errors without a dedicated code; those surface as
    /// plain error messages.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::PresetNotFound(_) => Some("preset-not-found"),
            Error::ModelNotFound { .. }
            | Error::RepositoryNotFound(_)
            | Error::InvalidQuantization { .. } => Some("model-not-found"),
            Error::AlreadyRunning | Error::ProcessStart(_) | Error::ProcessWait(_) => {
                Some("server-failed")
            }
            Error::Manifest(_) | Error::Download(_) | Error::Integrity { .. } => {
                Some("download-failed")
            }
            _ => None,
        }
    }

    pub(crate) fn preset_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PresetInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
