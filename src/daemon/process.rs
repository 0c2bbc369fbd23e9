//! Inference server process management
//!
//! Owns at most one external child. Termination is treated as a broadcast
//! event: a waiter task owns the `Child`, records the exit status, and
//! cancels a `done` token that any number of observers can watch without
//! blocking. Stop sends SIGTERM, waits a bounded grace period on the done
//! token, then force-kills.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Grace period between SIGTERM and SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(10);

/// One run of the child process, shared between the waiter task and
/// observers.
struct Running {
    pid: u32,
    /// Cancelled exactly once, when the child exits
    done: CancellationToken,
    exit: Mutex<Option<std::process::ExitStatus>>,
    wait_error: Mutex<Option<String>>,
}

/// Supervises one external subprocess.
pub struct ServerProcess {
    binary: PathBuf,
    current: ArcSwapOption<Running>,
}

impl ServerProcess {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            current: ArcSwapOption::empty(),
        }
    }

    /// Spawn the child with the given arguments. Environment is inherited;
    /// stdout and stderr go to `stdio` when provided, otherwise to the
    /// parent's stdio. Returns once the process is spawned.
    pub fn start(&self, args: &[String], stdio: Option<std::fs::File>) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args);
        if let Some(out) = stdio {
            let err = out
                .try_clone()
                .map_err(|e| Error::ProcessStart(format!("cannot clone log handle: {e}")))?;
            cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessStart(format!("{}: {e}", self.binary.display())))?;
        let pid = child.id().unwrap_or(0);
        info!(pid, binary = %self.binary.display(), "server process spawned");

        let running = Arc::new(Running {
            pid,
            done: CancellationToken::new(),
            exit: Mutex::new(None),
            wait_error: Mutex::new(None),
        });
        self.current.store(Some(running.clone()));

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    debug!(pid = running.pid, %status, "server process exited");
                    *running.exit.lock().unwrap() = Some(status);
                }
                Err(e) => {
                    warn!(pid = running.pid, error = %e, "waiting on server process failed");
                    *running.wait_error.lock().unwrap() = Some(e.to_string());
                }
            }
            running.done.cancel();
        });

        Ok(())
    }

    /// Stop the child: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Returns `Ok` when the child exits (voluntarily or force-killed);
    /// returns `Cancelled` if the token fires first, after force-killing.
    /// A stopped or never-started process is not an error.
    pub async fn stop(&self, token: &CancellationToken) -> Result<()> {
        let Some(running) = self.current.load_full() else {
            return Ok(());
        };
        if running.done.is_cancelled() {
            return Ok(());
        }

        info!(pid = running.pid, "stopping server process");
        signal_child(running.pid, false);

        tokio::select! {
            _ = running.done.cancelled() => Ok(()),
            _ = sleep(STOP_GRACE) => {
                warn!(pid = running.pid, "server process ignored SIGTERM, force-killing");
                signal_child(running.pid, true);
                running.done.cancelled().await;
                Ok(())
            }
            _ = token.cancelled() => {
                signal_child(running.pid, true);
                Err(Error::Cancelled)
            }
        }
    }

    /// Lock-free probe: started and not yet exited.
    pub fn is_running(&self) -> bool {
        self.current
            .load()
            .as_ref()
            .map(|r| !r.done.is_cancelled())
            .unwrap_or(false)
    }

    /// Token cancelled when the child exits. Already cancelled when no
    /// child was ever started.
    pub fn done(&self) -> CancellationToken {
        match self.current.load_full() {
            Some(running) => running.done.clone(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// Exit error of the last run; `None` while running or after a clean
    /// exit.
    pub fn exit_err(&self) -> Option<String> {
        let running = self.current.load_full()?;
        if !running.done.is_cancelled() {
            return None;
        }
        if let Some(e) = running.wait_error.lock().unwrap().clone() {
            return Some(e);
        }
        let result = match *running.exit.lock().unwrap() {
            Some(status) if status.success() => None,
            Some(status) => Some(format!("server process {status}")),
            None => Some("server process exit status unknown".to_string()),
        };
        result
    }

    pub fn pid(&self) -> Option<u32> {
        self.current
            .load()
            .as_ref()
            .filter(|r| !r.done.is_cancelled())
            .map(|r| r.pid)
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Some(running) = self.current.load_full() {
            if !running.done.is_cancelled() {
                signal_child(running.pid, true);
            }
        }
    }
}

#[cfg(unix)]
fn signal_child(pid: u32, force: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        warn!(pid, ?signal, error = %e, "failed to signal server process");
    }
}

#[cfg(not(unix))]
fn signal_child(pid: u32, _force: bool) {
    warn!(pid, "signalling child processes is only supported on unix");
}
