//! Daemon process management
//!
//! Handles daemonizing, PID file management, and stopping a running daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use daemonize::Daemonize;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long `stop` waits for a graceful exit before SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to read PID file {path}: {message}")]
    PidFileRead { path: String, message: String },

    #[error("Invalid PID in PID file {path}")]
    InvalidPid { path: String },

    #[error("No lifeline daemon is running")]
    NotRunning,

    #[error("lifeline is already running with PID {pid}")]
    AlreadyRunning { pid: i32 },

    #[error("Failed to daemonize process: {0}")]
    DaemonizeFailed(String),

    #[error("Failed to signal process {pid}: {source}")]
    SignalFailed { pid: i32, source: Errno },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// PID file bookkeeping for the running daemon
pub struct DaemonProcess {
    pid_file: PathBuf,
    /// Set once this process wrote the PID file; only then is it removed on drop
    owned: bool,
}

impl DaemonProcess {
    pub fn new(pid_file: PathBuf) -> Self {
        Self {
            pid_file,
            owned: false,
        }
    }

    /// PID recorded in the PID file, if that process is still alive
    ///
    /// A stale PID file is removed.
    pub fn running_pid(&self) -> Result<Option<i32>, DaemonError> {
        if !self.pid_file.exists() {
            return Ok(None);
        }

        let pid = self.read_pid()?;
        match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => Ok(Some(pid)),
            Err(Errno::ESRCH) => {
                debug!(pid, "Removing stale PID file");
                let _ = fs::remove_file(&self.pid_file);
                Ok(None)
            }
            Err(source) => Err(DaemonError::SignalFailed { pid, source }),
        }
    }

    /// Fail if another instance already holds the PID file
    pub fn ensure_not_running(&self) -> Result<(), DaemonError> {
        match self.running_pid()? {
            Some(pid) => Err(DaemonError::AlreadyRunning { pid }),
            None => Ok(()),
        }
    }

    /// Daemonize the current process
    ///
    /// Must run before any tokio runtime is created.
    pub fn daemonize(&mut self) -> Result<(), DaemonError> {
        self.create_parent_dir()?;

        let daemonize = Daemonize::new()
            .pid_file(&self.pid_file)
            .chown_pid_file(true)
            .working_directory("/")
            .umask(0o027);

        daemonize
            .start()
            .map_err(|e| DaemonError::DaemonizeFailed(e.to_string()))?;
        self.owned = true;

        info!(pid = process::id(), "Daemonized");
        Ok(())
    }

    /// Record the current process in the PID file (foreground mode)
    pub fn write_pid_file(&mut self) -> Result<(), DaemonError> {
        self.create_parent_dir()?;
        fs::write(&self.pid_file, format!("{}\n", process::id()))?;
        self.owned = true;
        Ok(())
    }

    /// Send SIGTERM to the running daemon and wait for it to exit
    ///
    /// Falls back to SIGKILL after a grace period.
    pub fn stop(&self) -> Result<i32, DaemonError> {
        let pid = self.running_pid()?.ok_or(DaemonError::NotRunning)?;
        let target = Pid::from_raw(pid);

        signal::kill(target, Signal::SIGTERM)
            .map_err(|source| DaemonError::SignalFailed { pid, source })?;

        let mut waited = Duration::ZERO;
        while waited < STOP_GRACE {
            std::thread::sleep(STOP_POLL);
            waited += STOP_POLL;
            if matches!(signal::kill(target, None), Err(Errno::ESRCH)) {
                info!(pid, "Daemon stopped");
                let _ = fs::remove_file(&self.pid_file);
                return Ok(pid);
            }
        }

        warn!(pid, "Daemon did not respond to SIGTERM, sending SIGKILL");
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => return Err(DaemonError::SignalFailed { pid, source }),
        }

        let _ = fs::remove_file(&self.pid_file);
        Ok(pid)
    }

    fn read_pid(&self) -> Result<i32, DaemonError> {
        let path = self.pid_file.to_string_lossy().to_string();
        let content = fs::read_to_string(&self.pid_file).map_err(|e| DaemonError::PidFileRead {
            path: path.clone(),
            message: e.to_string(),
        })?;

        content
            .trim()
            .parse()
            .map_err(|_| DaemonError::InvalidPid { path })
    }

    fn create_parent_dir(&self) -> Result<(), DaemonError> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        if self.owned {
            let _ = fs::remove_file(&self.pid_file);
        }
    }
}

/// Directory for the PID file and control socket
///
/// `XDG_RUNTIME_DIR` when set, otherwise `/tmp`.
fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| Path::new("/tmp").to_path_buf())
}

/// Get the default PID file path
pub fn get_default_pid_file() -> PathBuf {
    if std::env::var("XDG_RUNTIME_DIR").is_ok() {
        runtime_dir().join("lifeline.pid")
    } else {
        runtime_dir().join(format!("lifeline-{}.pid", nix::unistd::getuid()))
    }
}

/// Get the default control socket path
pub fn get_default_socket_path() -> PathBuf {
    if std::env::var("XDG_RUNTIME_DIR").is_ok() {
        runtime_dir().join("lifeline.sock")
    } else {
        runtime_dir().join(format!("lifeline-{}.sock", nix::unistd::getuid()))
    }
}
