//! Unix socket IPC for daemon control
//!
//! One JSON document per line in each direction. Every request gets one
//! response, except `watch`, which streams an update line whenever any
//! published state changes until the client hangs up.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lifeline_core::error::CoordinatorError;
use lifeline_core::vpn::{CoordinatorHandle, NetworkInfo, ReconnectionAttempt, StatusSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to connect to daemon socket {path}: {source}")]
    ConnectFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to bind IPC socket {path}: {source}")]
    BindFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed IPC message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Daemon closed the connection")]
    Closed,

    #[error("Unexpected response from daemon")]
    UnexpectedResponse,

    #[error("Daemon reported an error: {0}")]
    Remote(String),
}

/// Control requests accepted by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    Status,
    History,
    Watch,
    Reconnect,
    Disconnect,
    KillSwitch { enabled: bool },
    AutoReconnect { enabled: bool },
    Reset,
}

/// Everything `status` reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub snapshot: StatusSnapshot,
    pub session: Option<String>,
    pub interface: Option<String>,
    pub network: Option<NetworkInfo>,
    pub last_network_change: Option<DateTime<Utc>>,
    pub auto_reconnect: bool,
    pub total_attempts: u32,
    pub last_error: Option<String>,
}

impl StatusReport {
    fn collect(handle: &CoordinatorHandle) -> Self {
        let session = handle.active_session();
        Self {
            snapshot: handle.snapshot(),
            session: session.as_ref().map(|s| s.config.name.clone()),
            interface: session.map(|s| s.config.interface),
            network: handle.current_network(),
            last_network_change: handle.last_network_change(),
            auto_reconnect: handle.auto_reconnect_enabled(),
            total_attempts: handle.total_attempts(),
            last_error: handle.last_error(),
        }
    }
}

/// Daemon responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Status(Box<StatusReport>),
    History {
        attempts: Vec<ReconnectionAttempt>,
        total: u32,
    },
    Update(StatusSnapshot),
    /// Request accepted; `changed` is false when it had nothing to do
    Done { changed: bool },
    Error { message: String },
}

impl From<Result<bool, CoordinatorError>> for Response {
    fn from(result: Result<bool, CoordinatorError>) -> Self {
        match result {
            Ok(changed) => Response::Done { changed },
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }
}

impl From<Result<(), CoordinatorError>> for Response {
    fn from(result: Result<(), CoordinatorError>) -> Self {
        result.map(|()| true).into()
    }
}

async fn write_message<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    message: &T,
) -> Result<(), IpcError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// IPC client for talking to a running daemon
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn open(
        &self,
        request: &Request,
    ) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), IpcError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| IpcError::ConnectFailed {
                path: self.socket_path.display().to_string(),
                source,
            })?;
        let (reader, mut writer) = stream.into_split();
        write_message(&mut writer, request).await?;
        Ok((BufReader::new(reader), writer))
    }

    /// Send one request and read its response
    pub async fn send(&self, request: &Request) -> Result<Response, IpcError> {
        let (reader, _writer) = self.open(request).await?;
        let mut lines = reader.lines();
        let line = lines.next_line().await?.ok_or(IpcError::Closed)?;

        match serde_json::from_str(&line)? {
            Response::Error { message } => Err(IpcError::Remote(message)),
            response => Ok(response),
        }
    }

    pub async fn status(&self) -> Result<StatusReport, IpcError> {
        match self.send(&Request::Status).await? {
            Response::Status(report) => Ok(*report),
            _ => Err(IpcError::UnexpectedResponse),
        }
    }

    /// Send a control request; returns whether it changed anything
    pub async fn control(&self, request: Request) -> Result<bool, IpcError> {
        match self.send(&request).await? {
            Response::Done { changed } => Ok(changed),
            _ => Err(IpcError::UnexpectedResponse),
        }
    }

    /// Stream state updates into `on_update` until the daemon goes away
    pub async fn watch<F>(&self, mut on_update: F) -> Result<(), IpcError>
    where
        F: FnMut(StatusSnapshot),
    {
        let (reader, _writer) = self.open(&Request::Watch).await?;
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str(&line)? {
                Response::Update(snapshot) => on_update(snapshot),
                Response::Error { message } => return Err(IpcError::Remote(message)),
                _ => return Err(IpcError::UnexpectedResponse),
            }
        }
        Ok(())
    }
}

/// IPC server run by the daemon
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the control socket, replacing a leftover socket file
    pub fn bind(socket_path: &Path) -> Result<Self, IpcError> {
        let _ = std::fs::remove_file(socket_path);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path).map_err(|source| IpcError::BindFailed {
            path: socket_path.display().to_string(),
            source,
        })?;
        debug!(path = %socket_path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, handle: CoordinatorHandle, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handle = handle.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handle, cancel).await {
                                debug!(error = %e, "IPC connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "IPC accept error"),
                },
            }
        }
        debug!("IPC server stopped");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(
    stream: UnixStream,
    handle: CoordinatorHandle,
    cancel: CancellationToken,
) -> Result<(), IpcError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let response = Response::Error {
                    message: format!("Invalid request: {}", e),
                };
                write_message(&mut writer, &response).await?;
                continue;
            }
        };
        debug!(?request, "IPC request");

        if request == Request::Watch {
            return stream_updates(&mut writer, &handle, &cancel).await;
        }

        let response = dispatch(request, &handle).await;
        write_message(&mut writer, &response).await?;
    }

    Ok(())
}

async fn dispatch(request: Request, handle: &CoordinatorHandle) -> Response {
    match request {
        Request::Status => Response::Status(Box::new(StatusReport::collect(handle))),
        Request::History => Response::History {
            attempts: handle.reconnection_history(),
            total: handle.total_attempts(),
        },
        Request::Reconnect => handle.trigger_reconnection().await.into(),
        Request::Disconnect => handle.disconnect().await.into(),
        Request::KillSwitch { enabled: true } => handle.enable_kill_switch().await.into(),
        Request::KillSwitch { enabled: false } => handle.disable_kill_switch().await.into(),
        Request::AutoReconnect { enabled: true } => handle.enable_auto_reconnection().await.into(),
        Request::AutoReconnect { enabled: false } => {
            handle.disable_auto_reconnection().await.into()
        }
        Request::Reset => handle.reset_retries().await.into(),
        Request::Watch => Response::Error {
            message: "watch must be the only request on a connection".to_string(),
        },
    }
}

async fn stream_updates(
    writer: &mut OwnedWriteHalf,
    handle: &CoordinatorHandle,
    cancel: &CancellationToken,
) -> Result<(), IpcError> {
    let mut connectivity = handle.subscribe_connectivity();
    let mut health = handle.subscribe_health();
    let mut reconnection = handle.subscribe_reconnection();
    let mut kill_switch = handle.subscribe_kill_switch();

    // Each subscription replays its latest value; send one snapshot for all four
    let _ = (
        connectivity.try_recv(),
        health.try_recv(),
        reconnection.try_recv(),
        kill_switch.try_recv(),
    );
    write_message(writer, &Response::Update(handle.snapshot())).await?;

    loop {
        let changed = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            value = connectivity.recv() => value.is_some(),
            value = health.recv() => value.is_some(),
            value = reconnection.recv() => value.is_some(),
            value = kill_switch.recv() => value.is_some(),
        };
        if !changed {
            return Ok(());
        }
        write_message(writer, &Response::Update(handle.snapshot())).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lifeline_core::config::SessionConfig;
    use lifeline_core::error::{EngineError, KillSwitchError};
    use lifeline_core::vpn::{
        CallbackNetworkSource, CoordinatorOptions, FirewallBackend, KillSwitchRules,
        KillSwitchState, ReconnectionPolicy, ResilienceCoordinator, TunnelEngine,
        TunnelStatistics,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    struct IdleEngine;

    #[async_trait]
    impl TunnelEngine for IdleEngine {
        async fn start(&self, _session: &SessionConfig) -> Result<bool, EngineError> {
            Ok(false)
        }

        async fn stop(&self) -> Result<bool, EngineError> {
            Ok(false)
        }

        async fn is_running(&self) -> Result<bool, EngineError> {
            Ok(false)
        }

        async fn statistics(&self) -> Result<Option<TunnelStatistics>, EngineError> {
            Ok(None)
        }

        async fn last_error(&self) -> Option<String> {
            None
        }
    }

    struct NoopFirewall;

    #[async_trait]
    impl FirewallBackend for NoopFirewall {
        async fn install(&self, _rules: &KillSwitchRules) -> Result<(), KillSwitchError> {
            Ok(())
        }

        async fn remove(&self) -> Result<(), KillSwitchError> {
            Ok(())
        }
    }

    async fn running_coordinator() -> ResilienceCoordinator {
        let mut coordinator = ResilienceCoordinator::new(
            Arc::new(IdleEngine),
            Arc::new(NoopFirewall),
            Arc::new(CallbackNetworkSource::new()),
            ReconnectionPolicy::default(),
            CoordinatorOptions::default(),
        )
        .unwrap();
        coordinator.start().await;
        coordinator
    }

    #[tokio::test]
    async fn test_control_over_socket() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("lifeline.sock");
        let mut coordinator = running_coordinator().await;
        let server = IpcServer::bind(&socket).unwrap();
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(server.run(coordinator.handle(), cancel.clone()));
        let client = IpcClient::new(socket.clone());

        let report = client.status().await.unwrap();
        assert_eq!(report.session, None);
        assert!(report.auto_reconnect);
        assert_eq!(report.total_attempts, 0);

        // Nothing to reconnect without a session
        assert!(matches!(
            client.control(Request::Reconnect).await,
            Err(IpcError::Remote(_))
        ));

        assert!(client
            .control(Request::AutoReconnect { enabled: false })
            .await
            .unwrap());
        assert!(!client.status().await.unwrap().auto_reconnect);

        client
            .control(Request::KillSwitch { enabled: true })
            .await
            .unwrap();
        assert_eq!(
            client.status().await.unwrap().snapshot.kill_switch,
            KillSwitchState::Activated
        );

        match client.send(&Request::History).await.unwrap() {
            Response::History { attempts, total } => {
                assert!(attempts.is_empty());
                assert_eq!(total, 0);
            }
            other => panic!("Expected history, got {:?}", other),
        }

        cancel.cancel();
        server_task.await.unwrap();
        assert!(!socket.exists());
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_watch_streams_until_server_stops() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("lifeline.sock");
        let mut coordinator = running_coordinator().await;
        let handle = coordinator.handle();
        let server = IpcServer::bind(&socket).unwrap();
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(server.run(handle.clone(), cancel.clone()));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = IpcClient::new(socket);
        let watcher = tokio::spawn(async move {
            client
                .watch(move |snapshot| {
                    let _ = tx.send(snapshot);
                })
                .await
        });

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kill_switch, KillSwitchState::Disabled);

        handle.enable_kill_switch().await.unwrap();
        let mut latest = first;
        while latest.kill_switch != KillSwitchState::Activated {
            latest = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }

        cancel.cancel();
        server_task.await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        coordinator.stop().await;
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&Request::KillSwitch { enabled: true }).unwrap();
        assert_eq!(json, r#"{"request":"kill_switch","enabled":true}"#);

        let parsed: Request = serde_json::from_str(r#"{"request":"status"}"#).unwrap();
        assert_eq!(parsed, Request::Status);
    }

    #[test]
    fn test_coordinator_errors_become_error_responses() {
        let response: Response = Err::<bool, _>(CoordinatorError::NotRunning).into();
        assert!(matches!(response, Response::Error { .. }));

        let response: Response = Ok::<(), CoordinatorError>(()).into();
        assert_eq!(response, Response::Done { changed: true });
    }
}
