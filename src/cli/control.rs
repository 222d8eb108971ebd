//! Control commands that talk to a running daemon over its socket

use std::path::PathBuf;

use chrono::Local;
use colored::{ColoredString, Colorize};
use lifeline_core::vpn::{
    ConnectivityState, HealthState, KillSwitchState, ReconnectionState, StatusSnapshot,
};

use crate::daemon::ipc::{IpcClient, Request, Response};
use crate::daemon::process::DaemonProcess;

fn paint_connectivity(state: ConnectivityState) -> ColoredString {
    let text = state.to_string();
    if state.has_validated_internet() {
        text.green()
    } else if state.is_offline() {
        text.red()
    } else {
        text.yellow()
    }
}

fn paint_health(state: HealthState) -> ColoredString {
    match state {
        HealthState::Good => "good".green(),
        HealthState::Poor => "poor".yellow(),
        HealthState::Disconnected => "disconnected".red(),
        HealthState::Unknown => "unknown".dimmed(),
    }
}

fn paint_reconnection(state: &ReconnectionState) -> ColoredString {
    let text = state.to_string();
    match state {
        ReconnectionState::Idle => text.normal(),
        ReconnectionState::Attempting { .. } => text.yellow(),
        ReconnectionState::Success => text.green(),
        ReconnectionState::Failed { .. } => text.red().bold(),
    }
}

fn paint_kill_switch(state: &KillSwitchState) -> ColoredString {
    let text = state.to_string();
    match state {
        KillSwitchState::Disabled => text.dimmed(),
        KillSwitchState::Enabled | KillSwitchState::Deactivated => text.green(),
        KillSwitchState::Activated => text.yellow().bold(),
        KillSwitchState::Error(_) => text.red().bold(),
    }
}

fn on_off(enabled: bool) -> ColoredString {
    if enabled {
        "on".green()
    } else {
        "off".dimmed()
    }
}

fn print_snapshot(snapshot: &StatusSnapshot) {
    println!("  {:<13} {}", "Connectivity:", paint_connectivity(snapshot.connectivity));
    println!("  {:<13} {}", "Health:", paint_health(snapshot.health));
    println!("  {:<13} {}", "Reconnection:", paint_reconnection(&snapshot.reconnection));
    println!("  {:<13} {}", "Kill switch:", paint_kill_switch(&snapshot.kill_switch));
}

/// Print the daemon's current status
pub async fn run_status(socket: PathBuf, json: bool) -> anyhow::Result<()> {
    let report = IpcClient::new(socket).status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match (&report.session, &report.interface) {
        (Some(name), Some(interface)) => {
            println!("{} {} ({})", "Session:".bold(), name.cyan(), interface)
        }
        _ => println!("{} {}", "Session:".bold(), "none".dimmed()),
    }
    print_snapshot(&report.snapshot);

    match &report.network {
        Some(network) => {
            let changed = report
                .last_network_change
                .map(|at| at.with_timezone(&Local).format(" since %H:%M:%S").to_string())
                .unwrap_or_default();
            println!("  {:<13} {}{}", "Network:", network.network_id, changed);
        }
        None => println!("  {:<13} {}", "Network:", "none".dimmed()),
    }

    println!("  {:<13} {}", "Auto:", on_off(report.auto_reconnect));
    println!("  {:<13} {}", "Attempts:", report.total_attempts);
    if let Some(error) = &report.last_error {
        println!("  {:<13} {}", "Last error:", error.red());
    }
    Ok(())
}

/// Stream state changes until interrupted
pub async fn run_watch(socket: PathBuf) -> anyhow::Result<()> {
    IpcClient::new(socket)
        .watch(|snapshot| {
            println!("{}", Local::now().format("%H:%M:%S").to_string().dimmed());
            print_snapshot(&snapshot);
        })
        .await?;
    Ok(())
}

/// Print recorded reconnection attempts, oldest first
pub async fn run_history(socket: PathBuf, json: bool) -> anyhow::Result<()> {
    let (attempts, total) = match IpcClient::new(socket).send(&Request::History).await? {
        Response::History { attempts, total } => (attempts, total),
        _ => anyhow::bail!("Unexpected response from daemon"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&attempts)?);
        return Ok(());
    }

    if attempts.is_empty() {
        println!("No reconnection attempts recorded");
        return Ok(());
    }

    for record in &attempts {
        let outcome = if record.success {
            "ok".green()
        } else {
            "failed".red()
        };
        print!(
            "{}  #{:<3} {:<8} {}",
            record.at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            record.attempt,
            outcome,
            record.trigger
        );
        match &record.error {
            Some(error) => println!(" ({})", error.dimmed()),
            None => println!(),
        }
    }
    println!("{} attempt(s) since last reset", total);
    Ok(())
}

/// Send a control request and report whether it changed anything
pub async fn run_control(socket: PathBuf, request: Request) -> anyhow::Result<()> {
    let label = match &request {
        Request::Reconnect => "Reconnection",
        Request::Disconnect => "Disconnect",
        Request::KillSwitch { .. } => "Kill switch",
        Request::AutoReconnect { .. } => "Automatic reconnection",
        Request::Reset => "Retry reset",
        Request::Status | Request::History | Request::Watch => {
            anyhow::bail!("{:?} is not a control request", request)
        }
    };

    let changed = IpcClient::new(socket).control(request).await?;
    if changed {
        println!("{} {}", "✓".green(), label);
    } else {
        println!("{} {}: nothing to do", "-".dimmed(), label);
    }
    Ok(())
}

/// Stop the running daemon
pub fn run_stop(pid_file: PathBuf) -> anyhow::Result<()> {
    let pid = DaemonProcess::new(pid_file).stop()?;
    println!("{} Stopped lifeline (PID {})", "✓".green(), pid);
    Ok(())
}
