//! lifeline - VPN network resilience daemon
//!
//! Keeps a tunnel engine connected across network changes: reconnects
//! with exponential backoff, checks tunnel health and can block traffic
//! outside the tunnel while it is down.

use std::future::Future;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use lifeline_core::error::{ConfigError, LifelineError};
use lifeline_core::init_logging;

mod cli;
mod daemon;

use cli::run::RunOptions;
use daemon::ipc::Request;

#[derive(Parser)]
#[command(name = "lifeline")]
#[command(version, about = "Keeps a VPN tunnel alive across unreliable networks")]
struct Cli {
    /// Control socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// PID file path
    #[arg(long, global = true)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator and connect the configured session
    Run {
        /// Configuration file (defaults to ~/.config/lifeline/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Detach from the terminal
        #[arg(short, long)]
        daemon: bool,

        /// Start monitoring without connecting the session
        #[arg(long)]
        no_connect: bool,
    },
    /// Show connectivity, health, reconnection and kill switch state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Stream state changes
    Watch,
    /// Show recorded reconnection attempts
    History {
        #[arg(long)]
        json: bool,
    },
    /// Start a reconnection cycle now
    Reconnect,
    /// Stop the tunnel and forget the session
    Disconnect,
    /// Arm or disarm the kill switch
    KillSwitch { state: Toggle },
    /// Turn automatic reconnection on or off
    AutoReconnect { state: Toggle },
    /// Clear the attempt counter and leave the failed state
    Reset,
    /// Stop the running daemon
    Stop,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

fn block_on<F>(future: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(future)
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<LifelineError>() {
        // Configuration errors (exit code 2)
        Some(LifelineError::Config(_))
        | Some(LifelineError::Toml(_))
        | Some(LifelineError::TomlSerialize(_)) => 2,
        _ if error.downcast_ref::<ConfigError>().is_some() => 2,
        // Everything else is a runtime failure (exit code 1)
        _ => 1,
    }
}

fn main() {
    // Initialize logging
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();
    let socket = cli
        .socket
        .unwrap_or_else(daemon::process::get_default_socket_path);
    let pid_file = cli
        .pid_file
        .unwrap_or_else(daemon::process::get_default_pid_file);

    let result = match cli.command {
        Commands::Run {
            config,
            daemon,
            no_connect,
        } => cli::run::run(RunOptions {
            config,
            daemon,
            connect: !no_connect,
            socket,
            pid_file,
        }),
        Commands::Status { json } => block_on(cli::control::run_status(socket, json)),
        Commands::Watch => block_on(cli::control::run_watch(socket)),
        Commands::History { json } => block_on(cli::control::run_history(socket, json)),
        Commands::Reconnect => block_on(cli::control::run_control(socket, Request::Reconnect)),
        Commands::Disconnect => block_on(cli::control::run_control(socket, Request::Disconnect)),
        Commands::KillSwitch { state } => block_on(cli::control::run_control(
            socket,
            Request::KillSwitch {
                enabled: state.enabled(),
            },
        )),
        Commands::AutoReconnect { state } => block_on(cli::control::run_control(
            socket,
            Request::AutoReconnect {
                enabled: state.enabled(),
            },
        )),
        Commands::Reset => block_on(cli::control::run_control(socket, Request::Reset)),
        Commands::Stop => cli::control::run_stop(pid_file),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(exit_code(&e));
        }
    }
}
