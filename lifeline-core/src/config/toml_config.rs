//! TOML configuration file I/O
//!
//! Handles loading and saving the daemon configuration to/from TOML files
//! in the user's configuration directory.

use crate::config::SessionConfig;
use crate::error::{ConfigError, LifelineError};
use crate::vpn::coordinator::{CoordinatorOptions, CoordinatorSettings};
use crate::vpn::health_check::HealthSettings;
use crate::vpn::kill_switch::KillSwitchSettings;
use crate::vpn::reconnection::ReconnectionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Complete TOML configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Tunnel session handed to the engine
    pub session: SessionConfig,

    /// Reconnection policy; validated while parsing
    #[serde(default)]
    pub reconnection: ReconnectionPolicy,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    #[serde(default)]
    pub kill_switch: KillSwitchSettings,
}

impl TomlConfig {
    /// Create a configuration with default policy and settings
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            reconnection: ReconnectionPolicy::default(),
            health: HealthSettings::default(),
            coordinator: CoordinatorSettings::default(),
            kill_switch: KillSwitchSettings::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, LifelineError> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LifelineError::Config(ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }),
            _ => LifelineError::Config(ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            }),
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| {
            LifelineError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            })
        })?;

        config.validate()?;

        info!(
            session = %config.session.name,
            max_attempts = config.reconnection.max_attempts(),
            initial_delay_ms = config.reconnection.initial_delay().as_millis() as u64,
            max_delay_ms = config.reconnection.max_delay().as_millis() as u64,
            backoff_multiplier = config.reconnection.backoff_multiplier(),
            health_interval_secs = config.health.interval_secs,
            kill_switch = config.kill_switch.enabled,
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), LifelineError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LifelineError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        std::fs::write(path, contents).map_err(|e| {
            LifelineError::Config(ConfigError::IoError {
                message: format!("Failed to write config file: {}", e),
            })
        })?;

        debug!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Validate the parts serde cannot check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;

        self.health
            .validate()
            .map_err(|e| ConfigError::ValidationError {
                message: format!("Invalid health settings: {}", e),
            })?;

        if self.kill_switch.table.is_empty()
            || !self
                .kill_switch
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::ValidationError {
                message: format!("Invalid kill switch table name: {}", self.kill_switch.table),
            });
        }

        if self.coordinator.status_buffer == 0 {
            return Err(ConfigError::ValidationError {
                message: "coordinator.status_buffer must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Coordinator options carried by this configuration
    pub fn options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            coordinator: self.coordinator.clone(),
            health: self.health.clone(),
            kill_switch: self.kill_switch.clone(),
        }
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/lifeline, or LIFELINE_CONFIG_DIR if set
pub fn get_config_dir() -> Result<PathBuf, LifelineError> {
    // Allow tests to override config directory via environment variable
    if let Ok(config_dir) = std::env::var("LIFELINE_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| {
        LifelineError::Config(ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })
    })?;

    Ok(PathBuf::from(home).join(".config").join("lifeline"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, LifelineError> {
    let config_dir = get_config_dir()?;
    Ok(config_dir.join(CONFIG_FILE_NAME))
}

/// Load configuration from `path`, or the default location
pub fn load_config(path: Option<&Path>) -> Result<TomlConfig, LifelineError> {
    match path {
        Some(path) => TomlConfig::from_file(path),
        None => TomlConfig::from_file(&get_config_path()?),
    }
}
