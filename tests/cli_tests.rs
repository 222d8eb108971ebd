//! Integration tests for the lifeline command line
//!
//! These run the built binary and check exit codes and messages for the
//! paths that need no daemon, tunnel engine or root privileges.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn lifeline(args: &[&str], runtime_dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lifeline"))
        .args(args)
        .env("XDG_RUNTIME_DIR", runtime_dir)
        .env("LIFELINE_CONFIG_DIR", runtime_dir.join("config"))
        .env("LIFELINE_LOG", "error")
        .env_remove("JOURNAL_STREAM")
        .output()
        .expect("Failed to execute lifeline")
}

#[test]
fn test_help_lists_commands() {
    let dir = tempdir().unwrap();
    let output = lifeline(&["--help"], dir.path());

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["run", "status", "watch", "reconnect", "kill-switch", "auto-reconnect"] {
        assert!(stdout.contains(command), "help should mention {}", command);
    }
}

#[test]
fn test_run_without_config_is_a_config_error() {
    let dir = tempdir().unwrap();
    let output = lifeline(&["run"], dir.path());

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration file"));
}

#[test]
fn test_run_with_invalid_policy_is_a_config_error() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("bad.toml");
    fs::write(
        &config,
        r#"
[session]
name = "work"
command = "/usr/bin/sing-box"
interface = "tun0"

[reconnection]
max_attempts = 500
"#,
    )
    .unwrap();

    let output = lifeline(&["run", "--config", config.to_str().unwrap()], dir.path());

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("between 1 and 100"));
}

#[test]
fn test_status_without_daemon_is_a_runtime_error() {
    let dir = tempdir().unwrap();
    let output = lifeline(&["status"], dir.path());

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to connect to daemon socket"));
}

#[test]
fn test_stop_without_daemon() {
    let dir = tempdir().unwrap();
    let output = lifeline(&["stop"], dir.path());

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No lifeline daemon is running"));
}

#[test]
fn test_kill_switch_requires_on_or_off() {
    let dir = tempdir().unwrap();
    let output = lifeline(&["kill-switch", "maybe"], dir.path());

    // clap usage errors exit with 2
    assert_eq!(output.status.code(), Some(2));
}
