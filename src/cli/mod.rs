//! CLI command implementations
//!
//! `run` hosts the coordinator; the remaining subcommands are thin
//! clients of its control socket.

pub mod control;
pub mod run;
