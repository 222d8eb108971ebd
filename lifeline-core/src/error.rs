//! Error types for the lifeline resilience core
//!
//! Each component owns a small error enum; `LifelineError` ties them
//! together for callers that only want one type to bubble up.

use thiserror::Error;

/// Main error type for the lifeline application
#[derive(Error, Debug)]
pub enum LifelineError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors reported by the tunnel engine collaborator
    #[error("Tunnel engine error: {0}")]
    Engine(#[from] EngineError),

    /// Kill switch rule install/remove failures
    #[error("Kill switch error: {0}")]
    KillSwitch(#[from] KillSwitchError),

    /// Errors surfaced by the running coordinator
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Health checker setup errors
    #[error("Health check error: {0}")]
    HealthCheck(#[from] crate::vpn::health_check::HealthCheckError),

    /// Connectivity source errors
    #[error("Network monitor error: {0}")]
    NetworkMonitor(#[from] crate::vpn::network_monitor::NetworkMonitorError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// Errors returned by a tunnel engine
///
/// Everything except `InvalidConfig` is treated as transient and retried
/// under the reconnection policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start tunnel: {0}")]
    StartFailed(String),

    #[error("Failed to stop tunnel: {0}")]
    StopFailed(String),

    #[error("Tunnel query failed: {0}")]
    QueryFailed(String),

    #[error("Tunnel engine unavailable")]
    Unavailable,
}

impl EngineError {
    /// Whether the reconnection coordinator may retry after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EngineError::InvalidConfig(_))
    }
}

/// Kill switch rule management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KillSwitchError {
    #[error("Failed to install blocking rules: {0}")]
    InstallFailed(String),

    #[error("Failed to remove blocking rules: {0}")]
    RemoveFailed(String),

    #[error("Firewall backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Errors returned by the coordinator handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Coordinator is not running")]
    NotRunning,

    #[error("Coordinator stopped before replying")]
    Stopped,

    #[error("No active session")]
    NoSession,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    KillSwitch(#[from] KillSwitchError),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, LifelineError>;
