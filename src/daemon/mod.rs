//! Daemon support for the coordinator host
//!
//! PID file and daemonization, plus the Unix socket control protocol.

pub mod ipc;
pub mod process;
