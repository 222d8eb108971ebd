//! Resilience state model
//!
//! The four state enums owned by the coordinator, plus the network
//! snapshot and history records that travel with them. Every state is
//! replaced wholesale on each update (last write wins).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classified connectivity of the active network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    /// Not yet observed, or monitoring unavailable on this platform
    #[default]
    Unknown,

    /// No active network
    Disconnected,

    /// A link is up but internet access has not been validated
    ConnectedNoInternet,

    /// Validated internet over Wi-Fi
    ConnectedWifi,

    /// Validated internet over a cellular link
    ConnectedCellular,

    /// Validated internet over any other transport (ethernet, ...)
    ConnectedOther,
}

impl ConnectivityState {
    /// True for states that positively report no usable internet
    ///
    /// `Unknown` is not offline: a platform without connectivity
    /// reporting must not pin the tunnel health at `disconnected`.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::ConnectedNoInternet
        )
    }

    /// True when the active network has validated internet access
    pub fn has_validated_internet(&self) -> bool {
        matches!(
            self,
            ConnectivityState::ConnectedWifi
                | ConnectivityState::ConnectedCellular
                | ConnectivityState::ConnectedOther
        )
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Unknown => write!(f, "unknown"),
            ConnectivityState::Disconnected => write!(f, "disconnected"),
            ConnectivityState::ConnectedNoInternet => write!(f, "connected (no internet)"),
            ConnectivityState::ConnectedWifi => write!(f, "connected (wifi)"),
            ConnectivityState::ConnectedCellular => write!(f, "connected (cellular)"),
            ConnectivityState::ConnectedOther => write!(f, "connected (other)"),
        }
    }
}

/// Tunnel health verdict from the last health check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Good,
    Poor,
    Disconnected,
}

impl HealthState {
    /// Whether this verdict should be offered as a reconnection trigger
    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthState::Poor | HealthState::Disconnected)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Good => write!(f, "good"),
            HealthState::Poor => write!(f, "poor"),
            HealthState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Reconnection coordinator state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionState {
    #[default]
    Idle,

    /// Waiting for, or running, reconnection attempt `attempt` (1-indexed)
    Attempting {
        attempt: u32,
        delay: Duration,
    },

    /// The last attempt brought the tunnel back
    Success,

    /// Retries are exhausted, or the session configuration was rejected
    Failed {
        attempts: u32,
    },
}

impl ReconnectionState {
    pub fn is_attempting(&self) -> bool {
        matches!(self, ReconnectionState::Attempting { .. })
    }
}

impl std::fmt::Display for ReconnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectionState::Idle => write!(f, "idle"),
            ReconnectionState::Attempting { attempt, delay } => {
                write!(f, "attempting (attempt {}, delay {:?})", attempt, delay)
            }
            ReconnectionState::Success => write!(f, "success"),
            ReconnectionState::Failed { attempts } => {
                write!(f, "failed after {} attempts", attempts)
            }
        }
    }
}

/// Kill switch state
///
/// `Enabled`/`Disabled` follow the user toggle, `Activated`/`Deactivated`
/// whether the blocking rules are currently installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchState {
    #[default]
    Disabled,
    Enabled,
    Activated,
    Deactivated,
    Error(String),
}

impl std::fmt::Display for KillSwitchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillSwitchState::Disabled => write!(f, "disabled"),
            KillSwitchState::Enabled => write!(f, "enabled"),
            KillSwitchState::Activated => write!(f, "activated"),
            KillSwitchState::Deactivated => write!(f, "deactivated"),
            KillSwitchState::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Snapshot of the active network as reported by the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Platform network identifier (connection id, interface name, ...)
    pub network_id: String,
    pub is_wifi: bool,
    pub is_cellular: bool,
    pub is_ethernet: bool,
    pub is_vpn: bool,
    /// Internet access validated by the platform
    pub internet_validated: bool,
    /// Link bandwidth estimates, when the platform provides them
    pub downstream_kbps: Option<u32>,
    pub upstream_kbps: Option<u32>,
}

impl NetworkInfo {
    pub fn wifi(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            is_wifi: true,
            internet_validated: true,
            ..Default::default()
        }
    }

    pub fn cellular(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            is_cellular: true,
            internet_validated: true,
            ..Default::default()
        }
    }

    pub fn ethernet(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            is_ethernet: true,
            internet_validated: true,
            ..Default::default()
        }
    }

    /// Override the internet-validation flag
    pub fn with_internet(mut self, validated: bool) -> Self {
        self.internet_validated = validated;
        self
    }
}

/// Why a reconnection cycle was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectTrigger {
    /// Validated connectivity came back after a loss
    NetworkRegained,
    /// A health check reported `poor` or `disconnected`
    HealthDegraded(HealthState),
    /// Explicit request from the UI/CLI
    Manual,
}

impl std::fmt::Display for ReconnectTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectTrigger::NetworkRegained => write!(f, "network regained"),
            ReconnectTrigger::HealthDegraded(health) => write!(f, "health {}", health),
            ReconnectTrigger::Manual => write!(f, "manual trigger"),
        }
    }
}

/// One resolved reconnection attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectionAttempt {
    pub attempt: u32,
    pub trigger: ReconnectTrigger,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Latest value of every published state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub connectivity: ConnectivityState,
    pub health: HealthState,
    pub reconnection: ReconnectionState,
    pub kill_switch: KillSwitchState,
}
