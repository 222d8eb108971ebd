//! Process-supervising tunnel engine
//!
//! `ProcessEngine` runs an external tunnel binary (sing-box, xray,
//! wireguard-go, ...) as a child process. Liveness comes from the child,
//! traffic counters from the tunnel interface in sysfs, and the last error
//! from the binary's stderr.

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::vpn::engine::{TunnelEngine, TunnelHandle, TunnelStatistics};
use crate::vpn::output_parser::OutputParser;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long a freshly spawned engine must survive to count as started
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(1500);

/// How long to wait after SIGTERM before killing the engine
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Supervised {
    child: Child,
    pid: Option<u32>,
    interface: String,
}

/// Counters as last read, with the time they last moved
#[derive(Clone, Copy)]
struct CounterSample {
    rx: u64,
    tx: u64,
    changed_at: SystemTime,
}

/// Tunnel engine backed by a supervised child process
pub struct ProcessEngine {
    child: Mutex<Option<Supervised>>,
    last_error: Arc<StdMutex<Option<String>>>,
    sample: StdMutex<Option<CounterSample>>,
    parser: Arc<OutputParser>,
    startup_grace: Duration,
    stop_timeout: Duration,
    sysfs_root: PathBuf,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self {
            child: Mutex::new(None),
            last_error: Arc::new(StdMutex::new(None)),
            sample: StdMutex::new(None),
            parser: Arc::new(OutputParser::new()),
            startup_grace: DEFAULT_STARTUP_GRACE,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            sysfs_root: PathBuf::from("/sys"),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Read interface counters below `root` instead of `/sys`
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Keep an exit status as the last error unless the engine logged one
    fn record_exit(&self, message: String) {
        let mut last = lock(&self.last_error);
        if last.is_none() {
            *last = Some(message);
        }
    }

    /// Resolve the engine binary, bare names are looked up on PATH
    fn resolve_command(command: &Path) -> Result<PathBuf, EngineError> {
        if command.components().count() == 1 && !command.is_absolute() {
            return which::which(command).map_err(|e| {
                EngineError::InvalidConfig(format!(
                    "engine binary {} not found: {}",
                    command.display(),
                    e
                ))
            });
        }

        if command.is_file() {
            Ok(command.to_path_buf())
        } else {
            Err(EngineError::InvalidConfig(format!(
                "engine binary {} does not exist",
                command.display()
            )))
        }
    }

    /// Forward engine stderr to the log and keep the last error line
    fn watch_stderr(&self, stderr: ChildStderr) {
        let parser = Arc::clone(&self.parser);
        let last_error = Arc::clone(&self.last_error);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "lifeline::engine", "{}", line);
                if let Some(message) = parser.error_message(&line) {
                    warn!(error = %message, "Tunnel engine reported an error");
                    *lock(&last_error) = Some(message);
                }
            }
        });
    }

    async fn read_counter(&self, interface: &str, name: &str) -> Result<Option<u64>, EngineError> {
        let path = self
            .sysfs_root
            .join("class/net")
            .join(interface)
            .join("statistics")
            .join(name);

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content.trim().parse::<u64>().map(Some).map_err(|e| {
                EngineError::QueryFailed(format!("invalid counter in {}: {}", path.display(), e))
            }),
            // Interface not created yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::QueryFailed(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn terminate(&self, mut supervised: Supervised) -> Result<(), EngineError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Ok(Some(_)) = supervised.child.try_wait() {
            return Ok(());
        }

        if let Some(pid) = supervised.pid {
            info!(pid, "Sending SIGTERM to tunnel engine");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "Failed to send SIGTERM");
            }
        }

        match tokio::time::timeout(self.stop_timeout, supervised.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "Tunnel engine exited");
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::StopFailed(e.to_string())),
            Err(_) => {
                warn!("Tunnel engine ignored SIGTERM, killing it");
                supervised
                    .child
                    .kill()
                    .await
                    .map_err(|e| EngineError::StopFailed(e.to_string()))
            }
        }
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    #[tracing::instrument(skip(self, session), fields(session = %session.name))]
    async fn start(&self, session: &SessionConfig) -> Result<bool, EngineError> {
        session
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        let program = Self::resolve_command(&session.command)?;

        let mut guard = self.child.lock().await;
        if let Some(previous) = guard.take() {
            debug!("Restarting tunnel engine");
            self.terminate(previous).await?;
        }
        *lock(&self.sample) = None;

        let mut child = Command::new(&program)
            .args(&session.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::StartFailed(format!("failed to spawn {}: {}", program.display(), e)))?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            self.watch_stderr(stderr);
        }
        info!(pid = ?pid, program = %program.display(), "Tunnel engine spawned");

        tokio::time::sleep(self.startup_grace).await;

        match child.try_wait() {
            Ok(None) => {
                *guard = Some(Supervised {
                    child,
                    pid,
                    interface: session.interface.clone(),
                });
                Ok(true)
            }
            Ok(Some(status)) => {
                // Give the stderr reader a chance to record the cause
                tokio::task::yield_now().await;
                self.record_exit(format!("engine exited during startup ({})", status));
                warn!(%status, "Tunnel engine exited during startup");
                Ok(false)
            }
            Err(e) => Err(EngineError::QueryFailed(e.to_string())),
        }
    }

    async fn stop(&self) -> Result<bool, EngineError> {
        let supervised = self.child.lock().await.take();
        *lock(&self.sample) = None;

        match supervised {
            Some(supervised) => {
                self.terminate(supervised).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_running(&self) -> Result<bool, EngineError> {
        let mut guard = self.child.lock().await;
        let Some(supervised) = guard.as_mut() else {
            return Ok(false);
        };

        match supervised.child.try_wait() {
            Ok(None) => Ok(true),
            Ok(Some(status)) => {
                warn!(%status, "Tunnel engine exited");
                if !status.success() {
                    self.record_exit(format!("engine exited ({})", status));
                }
                *guard = None;
                Ok(false)
            }
            Err(e) => Err(EngineError::QueryFailed(e.to_string())),
        }
    }

    async fn statistics(&self) -> Result<Option<TunnelStatistics>, EngineError> {
        let interface = match self.child.lock().await.as_ref() {
            Some(supervised) => supervised.interface.clone(),
            None => return Ok(None),
        };

        let (Some(rx), Some(tx)) = (
            self.read_counter(&interface, "rx_bytes").await?,
            self.read_counter(&interface, "tx_bytes").await?,
        ) else {
            return Ok(None);
        };

        let now = SystemTime::now();
        let mut sample = lock(&self.sample);
        let changed_at = match *sample {
            Some(previous) if previous.rx == rx && previous.tx == tx => previous.changed_at,
            _ => now,
        };
        *sample = Some(CounterSample { rx, tx, changed_at });

        Ok(Some(TunnelStatistics {
            bytes_in: rx,
            bytes_out: tx,
            last_updated: changed_at,
        }))
    }

    async fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    async fn handle(&self) -> Option<TunnelHandle> {
        self.child
            .lock()
            .await
            .as_ref()
            .and_then(|supervised| supervised.pid)
            .map(TunnelHandle::Pid)
    }
}
