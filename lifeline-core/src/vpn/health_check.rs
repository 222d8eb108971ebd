//! Tunnel health checking
//!
//! `HealthChecker` judges whether a started tunnel is actually carrying
//! traffic: it combines the current connectivity classification with the
//! engine's liveness and statistics freshness, optionally confirmed by an
//! HTTP/HTTPS probe (`EndpointProbe`) through the tunnel.

use crate::vpn::engine::TunnelEngine;
use crate::vpn::state::{ConnectivityState, HealthState};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

fn default_interval_secs() -> u64 {
    30
}

fn default_stats_max_age_secs() -> u64 {
    90
}

fn default_probe_timeout_secs() -> u64 {
    5
}

/// `[health]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Seconds between health checks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Statistics older than this are considered stale
    #[serde(default = "default_stats_max_age_secs")]
    pub stats_max_age_secs: u64,

    /// Optional HTTP/HTTPS endpoint probed through the tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_endpoint: Option<String>,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stats_max_age_secs: default_stats_max_age_secs(),
            probe_endpoint: None,
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stats_max_age(&self) -> Duration {
        Duration::from_secs(self.stats_max_age_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Validate the health settings
    pub fn validate(&self) -> Result<(), HealthCheckError> {
        if self.interval_secs == 0 {
            return Err(HealthCheckError::InvalidSettings(
                "interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.stats_max_age_secs == 0 {
            return Err(HealthCheckError::InvalidSettings(
                "stats_max_age_secs must be greater than 0".to_string(),
            ));
        }
        if self.probe_timeout_secs == 0 {
            return Err(HealthCheckError::InvalidSettings(
                "probe_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(endpoint) = &self.probe_endpoint {
            parse_endpoint(endpoint)?;
        }
        Ok(())
    }
}

/// Errors that can occur during health check setup
#[derive(Debug, thiserror::Error)]
pub enum HealthCheckError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid health settings: {0}")]
    InvalidSettings(String),

    #[error("HTTP client creation failed: {0}")]
    ClientCreationFailed(#[from] reqwest::Error),
}

fn parse_endpoint(endpoint: &str) -> Result<Url, HealthCheckError> {
    let url = Url::parse(endpoint)
        .map_err(|e| HealthCheckError::InvalidUrl(format!("Failed to parse URL: {}", e)))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(HealthCheckError::InvalidUrl(format!(
            "Only HTTP/HTTPS schemes are supported, got: {}",
            scheme
        ))),
    }
}

/// Reachability check through the tunnel
///
/// Any 2xx or 3xx answer within the timeout counts as reachable.
#[derive(Debug)]
pub struct EndpointProbe {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl EndpointProbe {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, HealthCheckError> {
        let url = parse_endpoint(endpoint)?;
        let client = Client::builder()
            .timeout(timeout)
            .use_rustls_tls()
            .build()?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    /// GET the endpoint; the error is the reason health is downgraded
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    pub async fn reach(&self) -> Result<(), String> {
        let started = Instant::now();
        let response = self.client.get(self.url.clone()).send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("probe timed out after {}s", self.timeout.as_secs_f32())
            } else if e.is_connect() {
                format!("probe could not reach {}", self.url.host_str().unwrap_or("endpoint"))
            } else {
                format!("probe failed: {}", e)
            };
            warn!(reason = %reason, "Reachability probe failed");
            reason
        })?;

        let status = response.status();
        let elapsed_ms = started.elapsed().as_millis();
        if status.is_success() || status.is_redirection() {
            debug!(%status, elapsed_ms, "Endpoint reachable through tunnel");
            Ok(())
        } else {
            warn!(%status, elapsed_ms, "Endpoint answered with an error status");
            Err(format!("probe answered {}", status))
        }
    }
}

/// Outcome of one health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub state: HealthState,
    /// Why the verdict is not `Good`
    pub detail: Option<String>,
}

impl HealthReport {
    fn good() -> Self {
        Self {
            state: HealthState::Good,
            detail: None,
        }
    }

    fn with(state: HealthState, detail: impl Into<String>) -> Self {
        Self {
            state,
            detail: Some(detail.into()),
        }
    }
}

/// Classifies tunnel health from connectivity and engine state
pub struct HealthChecker {
    engine: Arc<dyn TunnelEngine>,
    probe: Option<EndpointProbe>,
    stats_max_age: Duration,
    interval: Duration,
}

impl HealthChecker {
    /// Build a checker from settings; the probe is created when configured
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        settings: &HealthSettings,
    ) -> Result<Self, HealthCheckError> {
        settings.validate()?;

        let probe = settings
            .probe_endpoint
            .as_deref()
            .map(|endpoint| EndpointProbe::new(endpoint, settings.probe_timeout()))
            .transpose()?;

        Ok(Self {
            engine,
            probe,
            stats_max_age: settings.stats_max_age(),
            interval: settings.interval(),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one health check against the current connectivity
    #[tracing::instrument(skip(self), fields(connectivity = %connectivity))]
    pub async fn check(&self, connectivity: ConnectivityState) -> HealthReport {
        if connectivity.is_offline() {
            return HealthReport::with(HealthState::Disconnected, "no validated internet");
        }

        match self.engine.is_running().await {
            Ok(true) => {}
            Ok(false) => return HealthReport::with(HealthState::Disconnected, "engine not running"),
            Err(e) => {
                debug!(error = %e, "Liveness query failed");
                return HealthReport::with(HealthState::Disconnected, e.to_string());
            }
        }

        match self.engine.statistics().await {
            Ok(Some(stats)) if stats.is_stale(SystemTime::now(), self.stats_max_age) => {
                return HealthReport::with(HealthState::Poor, "statistics are stale");
            }
            Ok(Some(_)) => {}
            Ok(None) => return HealthReport::with(HealthState::Poor, "no statistics reported"),
            Err(e) => return HealthReport::with(HealthState::Poor, e.to_string()),
        }

        if let Some(probe) = &self.probe {
            if let Err(reason) = probe.reach().await {
                return HealthReport::with(HealthState::Poor, reason);
            }
        }

        HealthReport::good()
    }

    /// Check on every interval tick until `cancel` fires
    ///
    /// The connectivity is read from `connectivity` at each tick; every
    /// report is handed to `on_report`.
    pub async fn run<F>(
        &self,
        connectivity: watch::Receiver<ConnectivityState>,
        cancel: CancellationToken,
        mut on_report: F,
    ) where
        F: FnMut(HealthReport) + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; health is judged one
        // interval after monitoring starts
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = *connectivity.borrow();
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.check(current) => report,
            };

            debug!(health = %report.state, detail = ?report.detail, "Health check completed");
            on_report(report);
        }

        debug!("Health check loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_accepts_http_and_https() {
        for endpoint in ["http://example.com/health", "https://example.com/generate_204"] {
            assert!(EndpointProbe::new(endpoint, Duration::from_secs(5)).is_ok());
        }
    }

    #[test]
    fn test_probe_rejects_other_schemes() {
        let err = EndpointProbe::new("ftp://example.com/health", Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("Only HTTP/HTTPS schemes"));

        let err = EndpointProbe::new("not a url", Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("parse URL"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = HealthSettings::default();
        assert_eq!(settings.interval(), Duration::from_secs(30));
        assert_eq!(settings.stats_max_age(), Duration::from_secs(90));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_reject_zero_interval() {
        let settings = HealthSettings {
            interval_secs: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_reject_bad_probe_endpoint() {
        let settings = HealthSettings {
            probe_endpoint: Some("gopher://example.com".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(HealthCheckError::InvalidUrl(_))
        ));
    }
}
