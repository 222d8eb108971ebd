//! NetworkManager connectivity source via D-Bus
//!
//! Listens for NetworkManager `StateChanged` signals and connectivity /
//! primary-connection property changes, and re-reads the default network
//! on each of them.

use crate::vpn::network_monitor::{NetworkMonitorError, NetworkSignal, NetworkSource};
use crate::vpn::state::NetworkInfo;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

const NM_BUS_NAME: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";
const NM_INTERFACE: &str = "org.freedesktop.NetworkManager";

/// NM_STATE_CONNECTED_LOCAL; anything below has no usable link
const NM_STATE_CONNECTED_LOCAL: u32 = 50;
/// NM_CONNECTIVITY_FULL
const NM_CONNECTIVITY_FULL: u32 = 4;

/// Transport flags for a NetworkManager connection type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportFlags {
    pub wifi: bool,
    pub cellular: bool,
    pub ethernet: bool,
    pub vpn: bool,
}

/// Map `PrimaryConnectionType` to transport flags
pub fn transport_flags(connection_type: &str) -> TransportFlags {
    let mut flags = TransportFlags::default();
    match connection_type {
        "802-11-wireless" | "wifi-p2p" => flags.wifi = true,
        "gsm" | "cdma" => flags.cellular = true,
        "802-3-ethernet" | "veth" | "bond" | "bridge" | "vlan" => flags.ethernet = true,
        "vpn" | "wireguard" | "tun" => flags.vpn = true,
        _ => {}
    }
    flags
}

/// `NetworkSource` backed by NetworkManager on the system bus
pub struct NetworkManagerSource {
    connection: Connection,
}

impl NetworkManagerSource {
    /// Connect to the system bus and verify NetworkManager is present
    #[tracing::instrument]
    pub async fn connect() -> Result<Self, NetworkMonitorError> {
        let connection = Connection::system().await?;

        let proxy = zbus::fdo::DBusProxy::new(&connection).await?;
        let bus_name = zbus::names::BusName::try_from(NM_BUS_NAME)
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;
        let name_has_owner = proxy
            .name_has_owner(bus_name)
            .await
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;

        if !name_has_owner {
            return Err(NetworkMonitorError::NetworkManagerUnavailable);
        }

        Ok(Self { connection })
    }

    async fn proxy(&self) -> Result<zbus::Proxy<'static>, NetworkMonitorError> {
        Ok(zbus::Proxy::new(&self.connection, NM_BUS_NAME, NM_PATH, NM_INTERFACE).await?)
    }

    /// Read the default network from NetworkManager properties
    async fn query(proxy: &zbus::Proxy<'_>) -> Result<Option<NetworkInfo>, NetworkMonitorError> {
        let state: u32 = proxy
            .get_property("State")
            .await
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;

        if state < NM_STATE_CONNECTED_LOCAL {
            return Ok(None);
        }

        let connectivity: u32 = proxy
            .get_property("Connectivity")
            .await
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;
        let connection_type: String = proxy
            .get_property("PrimaryConnectionType")
            .await
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;
        let primary: OwnedObjectPath = proxy
            .get_property("PrimaryConnection")
            .await
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;

        let flags = transport_flags(&connection_type);
        Ok(Some(NetworkInfo {
            network_id: primary.as_str().to_string(),
            is_wifi: flags.wifi,
            is_cellular: flags.cellular,
            is_ethernet: flags.ethernet,
            is_vpn: flags.vpn,
            internet_validated: connectivity == NM_CONNECTIVITY_FULL,
            downstream_kbps: None,
            upstream_kbps: None,
        }))
    }
}

#[async_trait]
impl NetworkSource for NetworkManagerSource {
    async fn current(&self) -> Result<Option<NetworkInfo>, NetworkMonitorError> {
        let proxy = self.proxy().await?;
        Self::query(&proxy).await
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<NetworkSignal>, NetworkMonitorError> {
        let proxy = self.proxy().await?;
        let mut state_changes = proxy.receive_signal("StateChanged").await?;
        let mut connectivity_changes = proxy.receive_property_changed::<u32>("Connectivity").await;
        let mut primary_changes = proxy
            .receive_property_changed::<String>("PrimaryConnectionType")
            .await;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut last = Self::query(&proxy).await.ok().flatten();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(_) = state_changes.next() => debug!("NetworkManager StateChanged"),
                    Some(_) = connectivity_changes.next() => debug!("NetworkManager Connectivity changed"),
                    Some(_) = primary_changes.next() => debug!("NetworkManager primary connection changed"),
                    else => break,
                }

                let signal = match Self::query(&proxy).await {
                    Ok(Some(info)) => {
                        let signal = if last.is_some() {
                            NetworkSignal::CapabilitiesChanged(info.clone())
                        } else {
                            NetworkSignal::Available(info.clone())
                        };
                        last = Some(info);
                        signal
                    }
                    Ok(None) => match last.take() {
                        Some(previous) => NetworkSignal::Lost {
                            network_id: previous.network_id,
                        },
                        None => continue,
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to query NetworkManager state");
                        continue;
                    }
                };

                if tx.send(signal).is_err() {
                    break;
                }
            }
            debug!("NetworkManager signal listener stopped");
        });

        Ok(rx)
    }
}
