//! Kill switch controller
//!
//! Blocks all traffic except loopback and what the tunnel itself needs
//! while the tunnel is down and the feature is armed. Rule management is
//! behind `FirewallBackend`; `NftablesBackend` is the Linux implementation
//! and installs one self-contained `inet` table atomically with `nft -f -`.

use crate::config::SessionConfig;
use crate::error::KillSwitchError;
use crate::vpn::publisher::StatusChannel;
use crate::vpn::state::KillSwitchState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

fn default_table() -> String {
    "lifeline_killswitch".to_string()
}

/// `[kill_switch]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchSettings {
    /// Arm the kill switch when the coordinator starts
    #[serde(default)]
    pub enabled: bool,

    /// nftables table owned by the kill switch
    #[serde(default = "default_table")]
    pub table: String,

    /// Keep private (RFC 1918 / ULA) destinations reachable
    #[serde(default)]
    pub allow_lan: bool,
}

impl Default for KillSwitchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            table: default_table(),
            allow_lan: false,
        }
    }
}

/// Allow-list carved out of the deny-by-default rule set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillSwitchRules {
    /// Tunnel interfaces whose traffic stays allowed
    pub allow_interfaces: Vec<String>,
    /// Tunnel server addresses needed to re-establish the tunnel
    pub allow_endpoints: Vec<IpAddr>,
    pub allow_lan: bool,
}

impl KillSwitchRules {
    /// Rules for re-establishing `session`
    pub fn from_session(session: &SessionConfig, allow_lan: bool) -> Self {
        Self {
            allow_interfaces: vec![session.interface.clone()],
            allow_endpoints: session.endpoints.clone(),
            allow_lan,
        }
    }
}

/// OS firewall operations used by the kill switch
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Install (or replace) the blocking rule set
    async fn install(&self, rules: &KillSwitchRules) -> Result<(), KillSwitchError>;

    /// Remove the blocking rule set; removing absent rules succeeds
    async fn remove(&self) -> Result<(), KillSwitchError>;
}

/// Linux kill switch using nftables
#[derive(Debug, Clone)]
pub struct NftablesBackend {
    table: String,
}

impl NftablesBackend {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Render the nft script for `rules`
    ///
    /// The leading `table`/`delete table` pair makes the script replace
    /// any previous copy of the table in the same transaction.
    pub fn render_ruleset(&self, rules: &KillSwitchRules) -> String {
        let table = &self.table;
        let mut allow = String::new();

        let _ = writeln!(allow, "    oifname \"lo\" accept");
        for iface in &rules.allow_interfaces {
            let _ = writeln!(allow, "    oifname \"{}\" accept", iface);
        }
        for endpoint in &rules.allow_endpoints {
            let family = if endpoint.is_ipv4() { "ip" } else { "ip6" };
            let _ = writeln!(allow, "    {} daddr {} accept", family, endpoint);
        }
        // DHCP so the underlying link can come back
        let _ = writeln!(allow, "    udp dport {{ 67, 68 }} accept");
        let _ = writeln!(allow, "    udp dport {{ 546, 547 }} accept");
        if rules.allow_lan {
            let _ = writeln!(
                allow,
                "    ip daddr {{ 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, 169.254.0.0/16 }} accept"
            );
            let _ = writeln!(allow, "    ip6 daddr {{ fc00::/7, fe80::/10 }} accept");
        }

        let mut inbound = String::new();
        let _ = writeln!(inbound, "    iifname \"lo\" accept");
        for iface in &rules.allow_interfaces {
            let _ = writeln!(inbound, "    iifname \"{}\" accept", iface);
        }
        let _ = writeln!(inbound, "    ct state established,related accept");

        format!(
            "table inet {table}\n\
             delete table inet {table}\n\
             table inet {table} {{\n  \
               chain output {{\n    \
                 type filter hook output priority 0; policy drop;\n\
             {allow}  }}\n  \
               chain input {{\n    \
                 type filter hook input priority 0; policy drop;\n\
             {inbound}  }}\n\
             }}\n"
        )
    }

    async fn nft(&self, args: &[&str], stdin: Option<String>) -> Result<(), String> {
        let mut child = Command::new("nft")
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to execute nft: {}", e))?;

        if let (Some(script), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(script.as_bytes())
                .await
                .map_err(|e| format!("failed to write ruleset: {}", e))?;
            // Closing stdin lets nft apply the script
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("nft did not complete: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    #[tracing::instrument(skip(self, rules), fields(table = %self.table))]
    async fn install(&self, rules: &KillSwitchRules) -> Result<(), KillSwitchError> {
        let script = self.render_ruleset(rules);
        debug!(ruleset = %script, "Installing kill switch table");

        self.nft(&["-f", "-"], Some(script))
            .await
            .map_err(KillSwitchError::InstallFailed)
    }

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn remove(&self) -> Result<(), KillSwitchError> {
        match self
            .nft(&["delete", "table", "inet", &self.table], None)
            .await
        {
            Ok(()) => Ok(()),
            Err(stderr) if stderr.contains("No such file") => {
                debug!("Kill switch table already absent");
                Ok(())
            }
            Err(stderr) => Err(KillSwitchError::RemoveFailed(stderr)),
        }
    }
}

/// Owns the kill switch rule and publishes its state
///
/// Only the coordinator task drives the controller, so methods take
/// `&mut self` and calls are naturally ordered.
pub struct KillSwitchController {
    backend: Arc<dyn FirewallBackend>,
    status: StatusChannel<KillSwitchState>,
    rules: KillSwitchRules,
    armed: bool,
    installed: bool,
}

impl KillSwitchController {
    pub fn new(backend: Arc<dyn FirewallBackend>, status: StatusChannel<KillSwitchState>) -> Self {
        Self {
            backend,
            status,
            rules: KillSwitchRules::default(),
            armed: false,
            installed: false,
        }
    }

    /// Replace the allow-list; an installed rule is re-installed with it
    pub async fn set_rules(&mut self, rules: KillSwitchRules) -> Result<(), KillSwitchError> {
        if rules == self.rules {
            return Ok(());
        }
        self.rules = rules;

        if self.installed {
            if let Err(e) = self.backend.install(&self.rules).await {
                error!(error = %e, "Failed to update kill switch rules");
                self.status.publish(KillSwitchState::Error(e.to_string()));
                return Err(e);
            }
            debug!("Kill switch rules updated");
        }
        Ok(())
    }

    /// Whether the blocking rule is currently installed
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Arm the kill switch; nothing is blocked until the tunnel goes down
    pub fn enable(&mut self) {
        self.armed = true;
        if self.installed {
            self.status.publish(KillSwitchState::Activated);
        } else {
            self.status.publish(KillSwitchState::Enabled);
        }
        info!("Kill switch enabled");
    }

    /// Disarm the kill switch and remove any active block
    pub async fn disable(&mut self) -> Result<(), KillSwitchError> {
        self.armed = false;
        if self.installed {
            self.remove().await?;
        }
        self.status.publish(KillSwitchState::Disabled);
        info!("Kill switch disabled");
        Ok(())
    }

    /// React to a tunnel-state transition
    ///
    /// Returns once the rule change has been applied; the caller publishes
    /// the tunnel transition only after that.
    pub async fn on_tunnel_state_changed(&mut self, connected: bool) -> Result<(), KillSwitchError> {
        if !self.armed {
            return Ok(());
        }

        if connected {
            if self.installed {
                self.remove().await?;
                self.status.publish(KillSwitchState::Deactivated);
                info!("Kill switch deactivated, tunnel is up");
            } else if matches!(self.status.latest(), KillSwitchState::Error(_)) {
                // A failed install left nothing behind to remove
                self.status.publish(KillSwitchState::Deactivated);
            }
            return Ok(());
        }

        if !self.installed {
            if let Err(e) = self.backend.install(&self.rules).await {
                error!(error = %e, "Kill switch activation failed, traffic may leak");
                self.status.publish(KillSwitchState::Error(e.to_string()));
                return Err(e);
            }
            self.installed = true;
            info!("Kill switch activated, blocking non-tunnel traffic");
        }
        self.status.publish(KillSwitchState::Activated);
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), KillSwitchError> {
        if let Err(e) = self.backend.remove().await {
            error!(error = %e, "Kill switch rule removal failed, traffic stays blocked");
            self.status.publish(KillSwitchState::Error(e.to_string()));
            return Err(e);
        }
        self.installed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<&'static str>>,
        fail_install: bool,
        fail_remove: bool,
    }

    #[async_trait]
    impl FirewallBackend for RecordingBackend {
        async fn install(&self, _rules: &KillSwitchRules) -> Result<(), KillSwitchError> {
            self.calls.lock().unwrap().push("install");
            if self.fail_install {
                return Err(KillSwitchError::InstallFailed("permission denied".to_string()));
            }
            Ok(())
        }

        async fn remove(&self) -> Result<(), KillSwitchError> {
            self.calls.lock().unwrap().push("remove");
            if self.fail_remove {
                return Err(KillSwitchError::RemoveFailed("busy".to_string()));
            }
            Ok(())
        }
    }

    fn controller(backend: Arc<RecordingBackend>) -> (KillSwitchController, StatusChannel<KillSwitchState>) {
        let status = StatusChannel::new(KillSwitchState::Disabled, 16);
        (KillSwitchController::new(backend, status.clone()), status)
    }

    #[tokio::test]
    async fn test_disarmed_ignores_transitions() {
        let backend = Arc::new(RecordingBackend::default());
        let (mut ks, status) = controller(backend.clone());

        ks.on_tunnel_state_changed(false).await.unwrap();
        assert!(backend.calls.lock().unwrap().is_empty());
        assert_eq!(status.latest(), KillSwitchState::Disabled);
    }

    #[tokio::test]
    async fn test_activate_then_deactivate() {
        let backend = Arc::new(RecordingBackend::default());
        let (mut ks, status) = controller(backend.clone());

        ks.enable();
        assert_eq!(status.latest(), KillSwitchState::Enabled);

        ks.on_tunnel_state_changed(false).await.unwrap();
        assert_eq!(status.latest(), KillSwitchState::Activated);
        // Already installed: confirmation only
        ks.on_tunnel_state_changed(false).await.unwrap();

        ks.on_tunnel_state_changed(true).await.unwrap();
        assert_eq!(status.latest(), KillSwitchState::Deactivated);
        assert_eq!(*backend.calls.lock().unwrap(), vec!["install", "remove"]);
    }

    #[tokio::test]
    async fn test_disable_while_activated() {
        let backend = Arc::new(RecordingBackend::default());
        let (mut ks, status) = controller(backend.clone());

        ks.enable();
        ks.on_tunnel_state_changed(false).await.unwrap();
        ks.disable().await.unwrap();

        assert_eq!(status.latest(), KillSwitchState::Disabled);
        assert!(!ks.is_installed());
    }

    #[tokio::test]
    async fn test_install_failure_surfaces_error() {
        let backend = Arc::new(RecordingBackend {
            fail_install: true,
            ..Default::default()
        });
        let (mut ks, status) = controller(backend);

        ks.enable();
        let result = ks.on_tunnel_state_changed(false).await;
        assert!(matches!(result, Err(KillSwitchError::InstallFailed(_))));
        assert!(matches!(status.latest(), KillSwitchState::Error(_)));
        assert!(!ks.is_installed());
    }

    #[tokio::test]
    async fn test_tunnel_up_clears_install_error() {
        let backend = Arc::new(RecordingBackend {
            fail_install: true,
            ..Default::default()
        });
        let (mut ks, status) = controller(backend.clone());

        ks.enable();
        assert!(ks.on_tunnel_state_changed(false).await.is_err());

        ks.on_tunnel_state_changed(true).await.unwrap();
        assert_eq!(status.latest(), KillSwitchState::Deactivated);
        // Nothing was installed, so nothing is removed
        assert_eq!(*backend.calls.lock().unwrap(), vec!["install"]);
    }

    #[tokio::test]
    async fn test_remove_failure_keeps_rule_installed() {
        let backend = Arc::new(RecordingBackend {
            fail_remove: true,
            ..Default::default()
        });
        let (mut ks, status) = controller(backend);

        ks.enable();
        ks.on_tunnel_state_changed(false).await.unwrap();
        assert!(ks.on_tunnel_state_changed(true).await.is_err());
        assert!(ks.is_installed());
        assert!(matches!(status.latest(), KillSwitchState::Error(_)));
    }

    #[test]
    fn test_render_ruleset() {
        let backend = NftablesBackend::new("lifeline_killswitch");
        let rules = KillSwitchRules {
            allow_interfaces: vec!["tun0".to_string()],
            allow_endpoints: vec!["203.0.113.7".parse().unwrap(), "2001:db8::1".parse().unwrap()],
            allow_lan: false,
        };

        let script = backend.render_ruleset(&rules);
        assert!(script.starts_with("table inet lifeline_killswitch\ndelete table inet lifeline_killswitch\n"));
        assert!(script.contains("policy drop;"));
        assert!(script.contains("oifname \"lo\" accept"));
        assert!(script.contains("oifname \"tun0\" accept"));
        assert!(script.contains("ip daddr 203.0.113.7 accept"));
        assert!(script.contains("ip6 daddr 2001:db8::1 accept"));
        assert!(!script.contains("192.168.0.0/16"));
    }

    #[test]
    fn test_render_ruleset_with_lan() {
        let backend = NftablesBackend::new("ks");
        let rules = KillSwitchRules {
            allow_lan: true,
            ..Default::default()
        };
        let script = backend.render_ruleset(&rules);
        assert!(script.contains("192.168.0.0/16"));
        assert!(script.contains("fc00::/7"));
    }
}
