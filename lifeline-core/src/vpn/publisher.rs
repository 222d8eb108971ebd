//! Status fan-out with replay of the latest value
//!
//! Each published state type gets a `StatusChannel`: a retained
//! last-value slot plus a bounded broadcast. New subscribers first see the
//! retained value, then every later change in emission order. Producers
//! never wait on subscribers; a subscriber that falls behind loses its
//! oldest buffered values.

use crate::vpn::state::{
    ConnectivityState, HealthState, KillSwitchState, ReconnectionState, StatusSnapshot,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::trace;

/// Default per-subscriber buffer capacity
pub const DEFAULT_STATUS_BUFFER: usize = 64;

struct Slot<T> {
    latest: T,
    tx: broadcast::Sender<T>,
}

/// Replay-one broadcast channel for a single state type
pub struct StatusChannel<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for StatusChannel<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> StatusChannel<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Create a channel holding `initial` with the given buffer capacity
    pub fn new(initial: T, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            slot: Arc::new(Mutex::new(Slot { latest: initial, tx })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // The slot only holds plain values, a poisoned lock is still usable
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish `value` if it differs from the retained one
    ///
    /// Returns true when the value changed and was broadcast.
    pub fn publish(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.latest == value {
            return false;
        }
        slot.latest = value.clone();
        // No receivers is fine, the slot still retains the value
        let _ = slot.tx.send(value);
        true
    }

    /// Current retained value
    pub fn latest(&self) -> T {
        self.lock().latest.clone()
    }

    /// Subscribe: the retained value is delivered first
    ///
    /// Taking the replay value and registering the receiver happen under
    /// the same lock as `publish`, so no change can fall in between.
    pub fn subscribe(&self) -> StatusSubscription<T> {
        let slot = self.lock();
        StatusSubscription {
            replay: Some(slot.latest.clone()),
            rx: slot.tx.subscribe(),
        }
    }
}

/// Receiving half of a `StatusChannel`
pub struct StatusSubscription<T> {
    replay: Option<T>,
    rx: broadcast::Receiver<T>,
}

impl<T> StatusSubscription<T>
where
    T: Clone + Send + 'static,
{
    /// Wait for the next value
    ///
    /// Returns `None` once every publisher handle is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }

        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    trace!(skipped, "Status subscriber lagged, oldest values dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next value if one is already buffered
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }

        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(skipped)) => {
                    trace!(skipped, "Status subscriber lagged, oldest values dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// One channel per published state type
#[derive(Clone)]
pub struct StatusPublisher {
    pub connectivity: StatusChannel<ConnectivityState>,
    pub health: StatusChannel<HealthState>,
    pub reconnection: StatusChannel<ReconnectionState>,
    pub kill_switch: StatusChannel<KillSwitchState>,
}

impl StatusPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            connectivity: StatusChannel::new(ConnectivityState::Unknown, capacity),
            health: StatusChannel::new(HealthState::Unknown, capacity),
            reconnection: StatusChannel::new(ReconnectionState::Idle, capacity),
            kill_switch: StatusChannel::new(KillSwitchState::Disabled, capacity),
        }
    }

    /// Latest value of every channel
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connectivity: self.connectivity.latest(),
            health: self.health.latest(),
            reconnection: self.reconnection.latest(),
            kill_switch: self.kill_switch.latest(),
        }
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_BUFFER)
    }
}
