//! Tunnel engine collaborator interface
//!
//! The engine that actually carries the tunnel is opaque to the
//! coordinator; it only needs start/stop/liveness/statistics.

use crate::config::SessionConfig;
use crate::error::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Traffic counters reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatistics {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_updated: SystemTime,
}

impl TunnelStatistics {
    /// Counters older than `max_age` no longer say anything about the tunnel
    ///
    /// A timestamp in the future (clock step) is treated as fresh.
    pub fn is_stale(&self, now: SystemTime, max_age: Duration) -> bool {
        now.duration_since(self.last_updated)
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

/// Platform handle of the running tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelHandle {
    /// Process id of a supervised engine process
    Pid(u32),
    /// Tunnel file descriptor handed over by the platform
    Fd(i32),
}

impl std::fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelHandle::Pid(pid) => write!(f, "pid {}", pid),
            TunnelHandle::Fd(fd) => write!(f, "fd {}", fd),
        }
    }
}

/// Operations consumed from the external tunnel engine
///
/// Every call may fail; the coordinator maps failures to state
/// transitions and never propagates them raw.
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Start (or restart) the tunnel for `session`; `Ok(false)` when the
    /// engine declined or the tunnel died during startup
    async fn start(&self, session: &SessionConfig) -> Result<bool, EngineError>;

    /// Stop the tunnel; `Ok(false)` when nothing was running
    async fn stop(&self) -> Result<bool, EngineError>;

    async fn is_running(&self) -> Result<bool, EngineError>;

    /// Current counters, `None` when the engine has nothing to report
    async fn statistics(&self) -> Result<Option<TunnelStatistics>, EngineError>;

    /// Last error message recorded by the engine
    async fn last_error(&self) -> Option<String>;

    /// Handle of the running tunnel, if the engine exposes one
    async fn handle(&self) -> Option<TunnelHandle> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_freshness() {
        let now = SystemTime::now();
        let stats = TunnelStatistics {
            bytes_in: 10,
            bytes_out: 20,
            last_updated: now - Duration::from_secs(30),
        };
        assert!(!stats.is_stale(now, Duration::from_secs(60)));
        assert!(stats.is_stale(now, Duration::from_secs(10)));
    }

    #[test]
    fn test_future_timestamp_is_fresh() {
        let now = SystemTime::now();
        let stats = TunnelStatistics {
            bytes_in: 0,
            bytes_out: 0,
            last_updated: now + Duration::from_secs(5),
        };
        assert!(!stats.is_stale(now, Duration::from_secs(1)));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(TunnelHandle::Pid(4242).to_string(), "pid 4242");
        assert_eq!(TunnelHandle::Fd(7).to_string(), "fd 7");
    }
}
