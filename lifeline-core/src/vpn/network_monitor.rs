//! Connectivity monitoring
//!
//! `ConnectivityMonitor` turns raw platform network signals into a
//! debounced `ConnectivityState`. Platform specifics stay behind the
//! `NetworkSource` trait: NetworkManager on Linux, or a host-fed
//! `CallbackNetworkSource` when the embedding application receives the OS
//! callbacks itself.

use crate::vpn::state::{ConnectivityState, NetworkInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw platform signal about the default network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkSignal {
    /// A network became the default network
    Available(NetworkInfo),

    /// The network with this id went away
    Lost { network_id: String },

    /// Transport or validation flags of the default network changed
    CapabilitiesChanged(NetworkInfo),

    /// Link properties (addresses, routes, bandwidth) changed
    PropertiesChanged(NetworkInfo),
}

/// Source of platform network signals
#[async_trait]
pub trait NetworkSource: Send + Sync {
    /// Snapshot of the current default network, `None` if there is none
    async fn current(&self) -> Result<Option<NetworkInfo>, NetworkMonitorError>;

    /// Register for signals until `cancel` fires or the receiver is dropped
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<NetworkSignal>, NetworkMonitorError>;
}

/// Errors that can occur during network monitoring
#[derive(Debug, thiserror::Error)]
pub enum NetworkMonitorError {
    #[error("D-Bus connection failed: {0}")]
    DBusConnectionFailed(#[from] zbus::Error),

    #[error("NetworkManager not available")]
    NetworkManagerUnavailable,

    #[error("Failed to query network state: {0}")]
    QueryFailed(String),

    #[error("Connectivity monitoring unsupported: {0}")]
    Unsupported(String),
}

/// Classify the default network
pub fn classify(network: Option<&NetworkInfo>) -> ConnectivityState {
    match network {
        None => ConnectivityState::Disconnected,
        Some(info) if !info.internet_validated => ConnectivityState::ConnectedNoInternet,
        Some(info) if info.is_wifi => ConnectivityState::ConnectedWifi,
        Some(info) if info.is_cellular => ConnectivityState::ConnectedCellular,
        Some(_) => ConnectivityState::ConnectedOther,
    }
}

/// Apply a signal to the tracked default network
fn apply_signal(active: &mut Option<NetworkInfo>, signal: NetworkSignal) {
    match signal {
        NetworkSignal::Available(info)
        | NetworkSignal::CapabilitiesChanged(info)
        | NetworkSignal::PropertiesChanged(info) => *active = Some(info),
        NetworkSignal::Lost { network_id } => {
            // Losing a network that is no longer the default changes nothing
            if active
                .as_ref()
                .map_or(true, |info| info.network_id == network_id)
            {
                *active = None;
            }
        }
    }
}

type StateCallback = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    active: Option<NetworkInfo>,
    state: ConnectivityState,
    last_change: Option<DateTime<Utc>>,
}

struct Tracker {
    shared: Arc<Mutex<MonitorState>>,
    callback: StateCallback,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Recompute the classification; the callback runs only on change
    fn update(&self, mutate: impl FnOnce(&mut Option<NetworkInfo>)) {
        let changed = {
            let mut guard = self.lock();
            mutate(&mut guard.active);
            let next = classify(guard.active.as_ref());
            if next == guard.state {
                None
            } else {
                guard.state = next;
                guard.last_change = Some(Utc::now());
                Some(next)
            }
        };

        if let Some(state) = changed {
            debug!(state = %state, "Connectivity changed");
            (self.callback)(state);
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Monitors the default network and reports classification changes
pub struct ConnectivityMonitor {
    source: Arc<dyn NetworkSource>,
    shared: Arc<Mutex<MonitorState>>,
    running: Option<Running>,
}

impl ConnectivityMonitor {
    pub fn new(source: Arc<dyn NetworkSource>) -> Self {
        Self {
            source,
            shared: Arc::new(Mutex::new(MonitorState::default())),
            running: None,
        }
    }

    /// Register for platform callbacks and evaluate the current network
    ///
    /// `callback` runs on every classification change, starting with the
    /// initial evaluation. If the platform source is unavailable the
    /// monitor degrades to a no-op that keeps reporting `Unknown`.
    pub async fn start_monitoring<F>(&mut self, callback: F)
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        if self.running.is_some() {
            debug!("Connectivity monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let tracker = Tracker {
            shared: Arc::clone(&self.shared),
            callback: Arc::new(callback),
        };

        // Subscribe before the snapshot so nothing slips in between
        let mut signals = match self.source.subscribe(cancel.child_token()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "Connectivity monitoring unavailable, reporting unknown");
                self.running = Some(Running { cancel, task: None });
                return;
            }
        };

        match self.source.current().await {
            Ok(current) => tracker.update(|active| *active = current),
            Err(e) => warn!(error = %e, "Failed to read current network"),
        }

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Some(signal) => {
                            debug!(?signal, "Network signal");
                            tracker.update(|active| apply_signal(active, signal));
                        }
                        None => {
                            warn!("Network signal source closed");
                            break;
                        }
                    },
                }
            }
        });

        info!("Connectivity monitoring started");
        self.running = Some(Running {
            cancel,
            task: Some(task),
        });
    }

    /// Unregister and clear all tracked state
    pub async fn stop_monitoring(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Some(task) = running.task {
                if let Err(e) = task.await {
                    warn!(error = %e, "Connectivity monitor task ended abnormally");
                }
            }
            info!("Connectivity monitoring stopped");
        }

        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = MonitorState::default();
    }

    /// Whether `start_monitoring` has been called without a matching stop
    pub fn is_monitoring(&self) -> bool {
        self.running.is_some()
    }

    /// Snapshot of the default network, `None` when there is none
    pub fn get_current_network_info(&self) -> Option<NetworkInfo> {
        self.lock().active.clone()
    }

    /// Last reported classification
    pub fn current_state(&self) -> ConnectivityState {
        self.lock().state
    }

    /// When the classification last changed
    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        self.lock().last_change
    }

    /// Shared read-only view for other components
    pub fn view(&self) -> NetworkView {
        NetworkView {
            shared: Arc::clone(&self.shared),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cloneable read-only view of the monitor's tracked network
#[derive(Clone)]
pub struct NetworkView {
    shared: Arc<Mutex<MonitorState>>,
}

impl NetworkView {
    pub fn network_info(&self) -> Option<NetworkInfo> {
        self.lock().active.clone()
    }

    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        self.lock().last_change
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct CallbackInner {
    current: Option<NetworkInfo>,
    subscribers: Vec<mpsc::UnboundedSender<NetworkSignal>>,
    unsupported: bool,
}

/// Network source fed by the host application
///
/// Mobile and desktop shells receive connectivity callbacks on their own
/// threads; they forward them here with `emit`.
#[derive(Clone, Default)]
pub struct CallbackNetworkSource {
    inner: Arc<Mutex<CallbackInner>>,
}

impl CallbackNetworkSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose platform API is missing; subscribing fails
    pub fn unsupported() -> Self {
        let source = Self::default();
        source.lock().unsupported = true;
        source
    }

    /// Forward a platform signal to every subscriber
    pub fn emit(&self, signal: NetworkSignal) {
        let mut inner = self.lock();
        apply_signal(&mut inner.current, signal.clone());
        inner
            .subscribers
            .retain(|tx| tx.send(signal.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, CallbackInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NetworkSource for CallbackNetworkSource {
    async fn current(&self) -> Result<Option<NetworkInfo>, NetworkMonitorError> {
        Ok(self.lock().current.clone())
    }

    async fn subscribe(
        &self,
        _cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<NetworkSignal>, NetworkMonitorError> {
        let mut inner = self.lock();
        if inner.unsupported {
            return Err(NetworkMonitorError::Unsupported(
                "no connectivity callbacks on this platform".to_string(),
            ));
        }
        // Dropped receivers are pruned on the next emit
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push(tx);
        Ok(rx)
    }
}
