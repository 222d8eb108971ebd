//! The `run` command: host the resilience coordinator
//!
//! Loads the configuration, optionally daemonizes, wires the coordinator
//! to the process engine, nftables and NetworkManager, and serves the
//! control socket until SIGTERM or Ctrl-C.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use lifeline_core::config::toml_config::{load_config, TomlConfig};
use lifeline_core::config::SessionConfig;
use lifeline_core::vpn::{
    CallbackNetworkSource, NetworkManagerSource, NetworkSource, NftablesBackend, ProcessEngine,
    ResilienceCoordinator,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::daemon::ipc::IpcServer;
use crate::daemon::process::DaemonProcess;

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub daemon: bool,
    pub connect: bool,
    pub socket: PathBuf,
    pub pid_file: PathBuf,
}

/// Run the coordinator until a termination signal arrives
pub fn run(options: RunOptions) -> anyhow::Result<()> {
    // Configuration problems surface before forking
    let config = load_config(options.config.as_deref())?;

    let mut process = DaemonProcess::new(options.pid_file);
    process.ensure_not_running()?;

    if options.daemon {
        process.daemonize()?;
    } else {
        process.write_pid_file()?;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let result = runtime.block_on(serve(config, options.socket, options.connect));

    drop(process);
    result
}

async fn network_source() -> Arc<dyn NetworkSource> {
    match NetworkManagerSource::connect().await {
        Ok(source) => Arc::new(source),
        Err(e) => {
            warn!(error = %e, "NetworkManager unavailable, connectivity will stay unknown");
            Arc::new(CallbackNetworkSource::unsupported())
        }
    }
}

async fn serve(config: TomlConfig, socket: PathBuf, connect: bool) -> anyhow::Result<()> {
    let engine = Arc::new(ProcessEngine::new());
    let firewall = Arc::new(NftablesBackend::new(config.kill_switch.table.clone()));
    let source = network_source().await;

    let coordinator = ResilienceCoordinator::new(
        engine,
        firewall,
        source,
        config.reconnection.clone(),
        config.options(),
    )?;

    // Bound before start so a socket error cannot strand an installed kill switch
    let server = IpcServer::bind(&socket)?;
    info!(socket = %socket.display(), "Control socket ready");

    let session = connect.then(|| config.session.clone());
    host(coordinator, server, session, wait_for_shutdown()).await
}

/// Start the coordinator, serve `server` and tear both down once `shutdown`
/// resolves
///
/// The coordinator is stopped on every path, so its kill switch rules are
/// removed even when `shutdown` fails.
async fn host<F>(
    mut coordinator: ResilienceCoordinator,
    server: IpcServer,
    session: Option<SessionConfig>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    coordinator.start().await;
    let handle = coordinator.handle();

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.run(handle.clone(), cancel.clone()));

    let result = async {
        if let Some(session) = session {
            let name = session.name.clone();
            match handle.connect(session).await {
                Ok(true) => info!(session = %name, "Tunnel is up"),
                Ok(false) => warn!(
                    session = %name,
                    error = handle.last_error().as_deref().unwrap_or("unknown"),
                    "Initial connection failed"
                ),
                Err(e) => error!(error = %e, "Failed to connect"),
            }
        }

        shutdown.await
    }
    .await;
    info!("Shutting down");

    cancel.cancel();
    if let Err(e) = server_task.await {
        warn!(error = %e, "IPC server task ended abnormally");
    }

    if let Err(e) = handle.disconnect().await {
        warn!(error = %e, "Failed to stop tunnel");
    }
    coordinator.stop().await;
    result
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;

    tokio::select! {
        _ = terminate.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C");
        }
    }
    Ok(())
}
