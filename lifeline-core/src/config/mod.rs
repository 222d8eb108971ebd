//! Configuration module
//!
//! Session configuration handed to the tunnel engine, plus TOML file I/O
//! for the full daemon configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

pub mod toml_config;

/// Tunnel session configuration
///
/// The coordinator treats this as an opaque, previously validated
/// reference; only the engine and the kill switch look inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Human readable session name (shown in status output)
    pub name: String,

    /// Tunnel engine executable (absolute path or a name looked up on PATH)
    pub command: PathBuf,

    /// Arguments passed to the engine executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Tunnel interface created by the engine (e.g. "tun0")
    pub interface: String,

    /// Remote endpoints the engine must reach to (re)establish the tunnel
    #[serde(default)]
    pub endpoints: Vec<IpAddr>,
}

impl SessionConfig {
    /// Create a new session configuration
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            interface: interface.into(),
            endpoints: Vec::new(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "session.name".to_string(),
            });
        }

        if self.command.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                field: "session.command".to_string(),
            });
        }

        if self.interface.is_empty() {
            return Err(ConfigError::MissingField {
                field: "session.interface".to_string(),
            });
        }

        // Interface names end up in nftables rules and sysfs paths
        if self.interface.len() > 15
            || !self
                .interface
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ConfigError::ValidationError {
                message: format!("Invalid interface name: {}", self.interface),
            });
        }

        Ok(())
    }
}
