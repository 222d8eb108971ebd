//! Core library for the lifeline VPN resilience daemon
//!
//! This crate keeps a VPN tunnel alive across unreliable connectivity:
//! it watches the network, judges tunnel health, reconnects with backoff
//! and drives a kill switch while the tunnel is down.

pub mod error;

pub mod config;
pub mod vpn;

/// Environment variable holding the log filter directive
pub const LOG_ENV: &str = "LIFELINE_LOG";

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under
/// systemd, otherwise logs to stderr with pretty formatting. The filter
/// is read from `LIFELINE_LOG` and defaults to `info`.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            // We're running under systemd, use journal logging
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(filter)
                .try_init()?;
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;

    Ok(())
}
