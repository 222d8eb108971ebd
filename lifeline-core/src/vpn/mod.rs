//! Network resilience module
//!
//! Connectivity monitoring, tunnel health checking, reconnection with
//! backoff and the kill switch, tied together by the coordinator.

pub mod engine;
pub mod output_parser;
pub mod process;
pub mod publisher;
pub mod state;

// Inputs to the coordinator
pub mod health_check;
pub mod network_manager;
pub mod network_monitor;

pub mod coordinator;
pub mod kill_switch;
pub mod reconnection;

// Public re-exports
pub use coordinator::{
    ActiveSession, CoordinatorHandle, CoordinatorOptions, CoordinatorSettings,
    ResilienceCoordinator,
};
pub use engine::{TunnelEngine, TunnelHandle, TunnelStatistics};
pub use health_check::{HealthChecker, HealthReport, HealthSettings};
pub use kill_switch::{
    FirewallBackend, KillSwitchController, KillSwitchRules, KillSwitchSettings, NftablesBackend,
};
pub use network_manager::NetworkManagerSource;
pub use network_monitor::{
    CallbackNetworkSource, ConnectivityMonitor, NetworkSignal, NetworkSource,
};
pub use output_parser::OutputParser;
pub use process::ProcessEngine;
pub use publisher::{StatusChannel, StatusPublisher, StatusSubscription};
pub use reconnection::ReconnectionPolicy;
pub use state::{
    ConnectivityState, HealthState, KillSwitchState, NetworkInfo, ReconnectTrigger,
    ReconnectionAttempt, ReconnectionState, StatusSnapshot,
};
