//! Reconnection coordinator
//!
//! All mutable resilience state (session, attempt counter, the four
//! published states) is owned by a single actor task. Connectivity
//! changes, health reports, and user commands all arrive as messages on
//! one channel, so they are applied one at a time in arrival order.
//!
//! At most one attempt future exists at any time. A reconnection attempt
//! is a discrete scheduled task: it sleeps for its backoff delay, checks
//! whether it is still needed, starts the engine, and waits until the
//! engine shows traffic. Attempt n+1 is only scheduled after attempt n has
//! resolved.

use crate::config::SessionConfig;
use crate::error::{CoordinatorError, EngineError, LifelineError};
use crate::vpn::engine::{TunnelEngine, TunnelHandle};
use crate::vpn::health_check::{HealthChecker, HealthReport, HealthSettings};
use crate::vpn::kill_switch::{
    FirewallBackend, KillSwitchController, KillSwitchRules, KillSwitchSettings,
};
use crate::vpn::network_monitor::{ConnectivityMonitor, NetworkSource, NetworkView};
use crate::vpn::publisher::{StatusPublisher, StatusSubscription, DEFAULT_STATUS_BUFFER};
use crate::vpn::reconnection::ReconnectionPolicy;
use crate::vpn::state::{
    ConnectivityState, HealthState, KillSwitchState, NetworkInfo, ReconnectTrigger,
    ReconnectionAttempt, ReconnectionState, StatusSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Number of resolved attempts kept in the history
pub const HISTORY_LIMIT: usize = 100;

/// Poll interval while waiting for a restarted tunnel to carry traffic
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn default_auto_reconnect() -> bool {
    true
}
fn default_settle_delay_ms() -> u64 {
    2_000
}
fn default_confirm_timeout_ms() -> u64 {
    10_000
}
fn default_status_buffer() -> usize {
    DEFAULT_STATUS_BUFFER
}

/// `[coordinator]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// React to connectivity and health triggers
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// How long `success` is shown before returning to `idle`
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// How long a started engine has to show traffic
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,

    /// Per-subscriber status buffer
    #[serde(default = "default_status_buffer")]
    pub status_buffer: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: default_auto_reconnect(),
            settle_delay_ms: default_settle_delay_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            status_buffer: default_status_buffer(),
        }
    }
}

impl CoordinatorSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

/// Everything the coordinator is configured with besides its collaborators
#[derive(Debug, Clone, Default)]
pub struct CoordinatorOptions {
    pub coordinator: CoordinatorSettings,
    pub health: HealthSettings,
    pub kill_switch: KillSwitchSettings,
}

/// The targeted tunnel configuration and its last known handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub config: SessionConfig,
    pub handle: Option<TunnelHandle>,
}

/// State readable from handles, written only by the actor
#[derive(Default)]
struct Shared {
    session: Option<ActiveSession>,
    history: VecDeque<ReconnectionAttempt>,
    total_attempts: u32,
    last_error: Option<String>,
    auto_reconnect: bool,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Command {
    Connect {
        session: SessionConfig,
        reply: oneshot::Sender<Result<bool, CoordinatorError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<bool, CoordinatorError>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<bool, CoordinatorError>>,
    },
    SetAutoReconnect {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    SetKillSwitch {
        enabled: bool,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    ResetRetries {
        reply: oneshot::Sender<()>,
    },
    Connectivity(ConnectivityState),
    Health(HealthReport),
}

enum AttemptOutcome {
    /// The engine runs and reports traffic
    Confirmed(Option<TunnelHandle>),
    /// Reconnection was no longer needed when the delay expired
    Moot,
    Failed(String),
    /// Non-retryable engine error
    Fatal(EngineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    /// Explicit `connect()`
    Initial,
    /// Reconnection attempt `attempt` of the current cycle
    Retry { attempt: u32 },
}

struct Pending {
    kind: AttemptKind,
    future: Pin<Box<dyn Future<Output = AttemptOutcome> + Send>>,
}

async fn run_attempt(
    engine: Arc<dyn TunnelEngine>,
    session: SessionConfig,
    delay: Duration,
    revalidate: bool,
    confirm_timeout: Duration,
) -> AttemptOutcome {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if revalidate {
        match engine.is_running().await {
            Ok(true) => return AttemptOutcome::Moot,
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Liveness query failed, attempting anyway"),
        }
    }

    match engine.start(&session).await {
        Ok(true) => {}
        Ok(false) => {
            let reason = engine
                .last_error()
                .await
                .unwrap_or_else(|| "tunnel engine did not start".to_string());
            return AttemptOutcome::Failed(reason);
        }
        Err(e) if !e.is_retryable() => return AttemptOutcome::Fatal(e),
        Err(e) => return AttemptOutcome::Failed(e.to_string()),
    }

    confirm_traffic(engine.as_ref(), confirm_timeout).await
}

/// Wait until the engine is running and reports statistics
async fn confirm_traffic(engine: &dyn TunnelEngine, timeout: Duration) -> AttemptOutcome {
    let deadline = Instant::now() + timeout;

    loop {
        match engine.is_running().await {
            Ok(true) => {}
            Ok(false) => {
                return AttemptOutcome::Failed("tunnel stopped before carrying traffic".to_string())
            }
            Err(e) => return AttemptOutcome::Failed(e.to_string()),
        }

        if let Ok(Some(_)) = engine.statistics().await {
            return AttemptOutcome::Confirmed(engine.handle().await);
        }

        if Instant::now() >= deadline {
            return AttemptOutcome::Failed(format!(
                "tunnel not confirmed within {:?}",
                timeout
            ));
        }
        tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
    }
}

async fn wait_pending(pending: &mut Option<Pending>) -> (AttemptKind, AttemptOutcome) {
    match pending {
        Some(pending) => {
            let outcome = pending.future.as_mut().await;
            (pending.kind, outcome)
        }
        None => std::future::pending().await,
    }
}

async fn wait_settle(settle: &mut Option<Pin<Box<Sleep>>>) {
    match settle {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

struct Actor {
    engine: Arc<dyn TunnelEngine>,
    policy: ReconnectionPolicy,
    settings: CoordinatorSettings,
    publisher: StatusPublisher,
    kill_switch: KillSwitchController,
    allow_lan: bool,
    shared: Arc<Mutex<Shared>>,
    connectivity_tx: watch::Sender<ConnectivityState>,

    session: Option<SessionConfig>,
    auto_reconnect: bool,
    trigger: ReconnectTrigger,
    pending: Option<Pending>,
    connect_reply: Option<oneshot::Sender<Result<bool, CoordinatorError>>>,
    settle: Option<Pin<Box<Sleep>>>,
    /// Connectivity was lost since the last validated network
    network_lost: bool,
    /// Whether the tunnel is believed to carry traffic
    tunnel_up: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
        arm_kill_switch: bool,
    ) {
        if arm_kill_switch {
            self.kill_switch.enable();
            self.sync_kill_switch().await;
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                (kind, outcome) = wait_pending(&mut self.pending) => {
                    self.pending = None;
                    self.on_outcome(kind, outcome).await;
                }
                _ = wait_settle(&mut self.settle) => {
                    self.settle = None;
                    self.publisher.reconnection.publish(ReconnectionState::Idle);
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { session, reply } => self.connect(session, reply).await,
            Command::Disconnect { reply } => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            Command::Reconnect { reply } => {
                let result = if self.session.is_none() {
                    Err(CoordinatorError::NoSession)
                } else {
                    Ok(self.start_cycle(ReconnectTrigger::Manual).await)
                };
                let _ = reply.send(result);
            }
            Command::SetAutoReconnect { enabled, reply } => {
                self.set_auto_reconnect(enabled);
                let _ = reply.send(());
            }
            Command::SetKillSwitch { enabled, reply } => {
                let result = if enabled {
                    self.kill_switch.enable();
                    self.sync_kill_switch().await;
                    Ok(())
                } else {
                    self.kill_switch.disable().await.map_err(CoordinatorError::from)
                };
                let _ = reply.send(result);
            }
            Command::ResetRetries { reply } => {
                self.reset_retries();
                let _ = reply.send(());
            }
            Command::Connectivity(state) => self.on_connectivity(state).await,
            Command::Health(report) => self.on_health(report).await,
        }
    }

    fn is_attempting(&self) -> bool {
        self.pending.is_some()
    }

    fn is_failed(&self) -> bool {
        matches!(
            self.publisher.reconnection.latest(),
            ReconnectionState::Failed { .. }
        )
    }

    /// Apply the tunnel state to the kill switch
    ///
    /// Failures are published as `KillSwitchState::Error` by the controller.
    async fn set_tunnel(&mut self, up: bool) {
        self.tunnel_up = up;
        self.sync_kill_switch().await;
    }

    async fn sync_kill_switch(&mut self) {
        if let Err(e) = self.kill_switch.on_tunnel_state_changed(self.tunnel_up).await {
            lock(&self.shared).last_error = Some(e.to_string());
        }
    }

    async fn connect(
        &mut self,
        session: SessionConfig,
        reply: oneshot::Sender<Result<bool, CoordinatorError>>,
    ) {
        info!(session = %session.name, "Connecting");
        self.cancel_pending();
        self.settle = None;

        let rules = KillSwitchRules::from_session(&session, self.allow_lan);
        if let Err(e) = self.kill_switch.set_rules(rules).await {
            lock(&self.shared).last_error = Some(e.to_string());
        }

        // The engine restarts, nothing passes until it confirms traffic
        self.set_tunnel(false).await;
        self.publisher.reconnection.publish(ReconnectionState::Idle);

        lock(&self.shared).session = Some(ActiveSession {
            config: session.clone(),
            handle: None,
        });
        self.pending = Some(Pending {
            kind: AttemptKind::Initial,
            future: Box::pin(run_attempt(
                Arc::clone(&self.engine),
                session.clone(),
                Duration::ZERO,
                false,
                self.settings.confirm_timeout(),
            )),
        });
        self.session = Some(session);
        self.connect_reply = Some(reply);
    }

    async fn disconnect(&mut self) -> Result<bool, CoordinatorError> {
        info!("Disconnecting");
        self.cancel_pending();
        self.settle = None;
        self.session = None;
        lock(&self.shared).session = None;

        let stopped = self.engine.stop().await;

        // An armed kill switch keeps blocking once the tunnel is gone
        self.set_tunnel(false).await;
        self.publisher.reconnection.publish(ReconnectionState::Idle);
        self.publisher.health.publish(HealthState::Disconnected);

        stopped.map_err(|e| {
            warn!(error = %e, "Tunnel engine failed to stop");
            CoordinatorError::Engine(e)
        })
    }

    /// Drop any scheduled attempt; an outstanding `connect()` resolves to false
    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(kind = ?pending.kind, "Cancelled pending attempt");
        }
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Ok(false));
        }
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
        lock(&self.shared).auto_reconnect = enabled;
        info!(enabled, "Automatic reconnection toggled");

        if !enabled {
            let retrying = matches!(
                self.pending,
                Some(Pending {
                    kind: AttemptKind::Retry { .. },
                    ..
                })
            );
            if retrying {
                self.pending = None;
                self.publisher.reconnection.publish(ReconnectionState::Idle);
            }
        }
    }

    fn reset_retries(&mut self) {
        {
            let mut shared = lock(&self.shared);
            shared.history.clear();
            shared.total_attempts = 0;
        }
        if self.is_failed() {
            self.publisher.reconnection.publish(ReconnectionState::Idle);
        }
        info!("Reconnection retries reset");
    }

    /// Begin a reconnection cycle unless an attempt is already in flight
    ///
    /// Returns whether a cycle was started.
    async fn start_cycle(&mut self, trigger: ReconnectTrigger) -> bool {
        if self.is_attempting() {
            debug!(trigger = %trigger, "Attempt already in flight, trigger ignored");
            return false;
        }
        if self.session.is_none() {
            debug!(trigger = %trigger, "No active session, trigger ignored");
            return false;
        }

        info!(trigger = %trigger, "Starting reconnection");
        self.settle = None;
        self.trigger = trigger;
        self.set_tunnel(false).await;
        self.schedule_attempt(1);
        true
    }

    fn schedule_attempt(&mut self, attempt: u32) {
        let Some(session) = self.session.clone() else {
            return;
        };

        let delay = self.policy.calculate_backoff(attempt);
        info!(
            attempt,
            max_attempts = self.policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnection attempt"
        );

        self.publisher
            .reconnection
            .publish(ReconnectionState::Attempting { attempt, delay });
        self.pending = Some(Pending {
            kind: AttemptKind::Retry { attempt },
            future: Box::pin(run_attempt(
                Arc::clone(&self.engine),
                session,
                delay,
                self.trigger != ReconnectTrigger::Manual,
                self.settings.confirm_timeout(),
            )),
        });
    }

    fn record(&mut self, attempt: u32, success: bool, error: Option<String>) {
        let mut shared = lock(&self.shared);
        if shared.history.len() >= HISTORY_LIMIT {
            shared.history.pop_front();
        }
        shared.history.push_back(ReconnectionAttempt {
            attempt,
            trigger: self.trigger,
            success,
            error,
            at: Utc::now(),
        });
        shared.total_attempts = shared.total_attempts.saturating_add(1);
    }

    fn remember_handle(&mut self, handle: Option<TunnelHandle>) {
        if let Some(session) = lock(&self.shared).session.as_mut() {
            session.handle = handle;
        }
    }

    async fn on_outcome(&mut self, kind: AttemptKind, outcome: AttemptOutcome) {
        match kind {
            AttemptKind::Initial => self.on_initial_outcome(outcome).await,
            AttemptKind::Retry { attempt } => self.on_retry_outcome(attempt, outcome).await,
        }
    }

    async fn on_initial_outcome(&mut self, outcome: AttemptOutcome) {
        let reply = self.connect_reply.take();
        let result = match outcome {
            AttemptOutcome::Confirmed(handle) => {
                self.remember_handle(handle);
                self.set_tunnel(true).await;
                self.publisher.health.publish(HealthState::Good);
                info!("Tunnel connected");
                Ok(true)
            }
            AttemptOutcome::Moot => Ok(true),
            AttemptOutcome::Failed(reason) => {
                warn!(error = %reason, "Initial connection failed");
                lock(&self.shared).last_error = Some(reason);
                self.publisher.health.publish(HealthState::Disconnected);
                if self.auto_reconnect {
                    self.start_cycle(ReconnectTrigger::Manual).await;
                }
                Ok(false)
            }
            AttemptOutcome::Fatal(e) => {
                error!(error = %e, "Session configuration rejected");
                lock(&self.shared).last_error = Some(e.to_string());
                self.publisher
                    .reconnection
                    .publish(ReconnectionState::Failed { attempts: 0 });
                Err(CoordinatorError::Engine(e))
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    async fn on_retry_outcome(&mut self, attempt: u32, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Confirmed(handle) => {
                self.record(attempt, true, None);
                self.remember_handle(handle);
                // Rules come down only now that traffic is confirmed
                self.set_tunnel(true).await;
                self.publisher.reconnection.publish(ReconnectionState::Success);
                self.publisher.health.publish(HealthState::Good);
                self.settle = Some(Box::pin(tokio::time::sleep(self.settings.settle_delay())));
                info!(attempt, "Reconnection succeeded");
            }
            AttemptOutcome::Moot => {
                debug!(attempt, "Tunnel already running, reconnection not needed");
                self.publisher.reconnection.publish(ReconnectionState::Idle);
            }
            AttemptOutcome::Failed(reason) => {
                warn!(attempt, error = %reason, "Reconnection attempt failed");
                self.record(attempt, false, Some(reason.clone()));

                if attempt >= self.policy.max_attempts() {
                    let engine_error = self.engine.last_error().await;
                    lock(&self.shared).last_error = Some(engine_error.unwrap_or(reason));
                    error!(attempts = attempt, "Reconnection retries exhausted");
                    self.publisher
                        .reconnection
                        .publish(ReconnectionState::Failed { attempts: attempt });
                } else {
                    self.schedule_attempt(attempt + 1);
                }
            }
            AttemptOutcome::Fatal(e) => {
                error!(attempt, error = %e, "Reconnection aborted, session configuration rejected");
                self.record(attempt, false, Some(e.to_string()));
                lock(&self.shared).last_error = Some(e.to_string());
                self.publisher
                    .reconnection
                    .publish(ReconnectionState::Failed { attempts: attempt });
            }
        }
    }

    async fn on_connectivity(&mut self, state: ConnectivityState) {
        self.connectivity_tx.send_replace(state);

        if state.is_offline() {
            self.network_lost = true;
            if self.session.is_some() && self.tunnel_up {
                // Blocked before anyone hears about the loss
                self.set_tunnel(false).await;
            }
            self.publisher.connectivity.publish(state);
            return;
        }

        self.publisher.connectivity.publish(state);

        if !state.has_validated_internet() || !self.network_lost {
            return;
        }
        self.network_lost = false;

        if self.session.is_none() || !self.auto_reconnect || self.is_attempting() {
            return;
        }

        match self.engine.is_running().await {
            Ok(true) => debug!("Network regained, tunnel still running"),
            Ok(false) | Err(_) => {
                self.start_cycle(ReconnectTrigger::NetworkRegained).await;
            }
        }
    }

    async fn on_health(&mut self, report: HealthReport) {
        let state = report.state;
        if state == HealthState::Disconnected && self.session.is_some() && self.tunnel_up {
            self.set_tunnel(false).await;
        }
        self.publisher.health.publish(state);

        match state {
            // A healthy tunnel confirms traffic even without a cycle
            HealthState::Good if !self.is_attempting() && self.session.is_some() => {
                if !self.tunnel_up {
                    self.set_tunnel(true).await;
                }
                if self.is_failed() {
                    // Recovered on its own, later outages are retried again
                    lock(&self.shared).total_attempts = 0;
                    self.publisher.reconnection.publish(ReconnectionState::Idle);
                    info!("Tunnel healthy again, leaving failed state");
                }
            }
            _ if state.is_degraded() && self.session.is_some() => {
                if !self.auto_reconnect {
                    return;
                }
                if self.is_failed() {
                    debug!(health = %state, "Retries exhausted, health trigger ignored");
                    return;
                }
                debug!(health = %state, detail = ?report.detail, "Degraded tunnel health");
                self.start_cycle(ReconnectTrigger::HealthDegraded(state)).await;
            }
            _ => {}
        }
    }

    async fn shutdown(mut self) {
        self.pending = None;
        // Dropping the reply tells a waiting connect() the coordinator stopped
        self.connect_reply = None;
        self.settle = None;
        self.session = None;
        lock(&self.shared).session = None;

        if let Err(e) = self.kill_switch.disable().await {
            warn!(error = %e, "Failed to release kill switch on stop");
        }
        self.publisher.reconnection.publish(ReconnectionState::Idle);
        self.publisher.health.publish(HealthState::Unknown);
        self.publisher.connectivity.publish(ConnectivityState::Unknown);
        debug!("Coordinator task stopped");
    }
}

struct Tasks {
    cancel: CancellationToken,
    actor: JoinHandle<()>,
    health: JoinHandle<()>,
}

/// The network resilience coordinator
///
/// Owns its collaborators; the UI and control surfaces talk to it through
/// a cloneable `CoordinatorHandle`.
pub struct ResilienceCoordinator {
    engine: Arc<dyn TunnelEngine>,
    firewall: Arc<dyn FirewallBackend>,
    monitor: ConnectivityMonitor,
    health: Arc<HealthChecker>,
    policy: ReconnectionPolicy,
    options: CoordinatorOptions,
    publisher: StatusPublisher,
    shared: Arc<Mutex<Shared>>,
    sender: Arc<RwLock<Option<mpsc::UnboundedSender<Command>>>>,
    tasks: Option<Tasks>,
}

impl ResilienceCoordinator {
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        firewall: Arc<dyn FirewallBackend>,
        source: Arc<dyn NetworkSource>,
        policy: ReconnectionPolicy,
        options: CoordinatorOptions,
    ) -> Result<Self, LifelineError> {
        let health = HealthChecker::new(Arc::clone(&engine), &options.health)?;
        let shared = Shared {
            auto_reconnect: options.coordinator.auto_reconnect,
            ..Default::default()
        };

        Ok(Self {
            engine,
            firewall,
            monitor: ConnectivityMonitor::new(source),
            health: Arc::new(health),
            policy,
            publisher: StatusPublisher::new(options.coordinator.status_buffer),
            options,
            shared: Arc::new(Mutex::new(shared)),
            sender: Arc::new(RwLock::new(None)),
            tasks: None,
        })
    }

    /// Start monitoring, health checks and the coordinator task
    pub async fn start(&mut self) {
        if self.tasks.is_some() {
            debug!("Coordinator already running");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (connectivity_tx, connectivity_rx) = watch::channel(ConnectivityState::Unknown);
        let auto_reconnect = lock(&self.shared).auto_reconnect;

        let actor = Actor {
            engine: Arc::clone(&self.engine),
            policy: self.policy.clone(),
            settings: self.options.coordinator.clone(),
            publisher: self.publisher.clone(),
            kill_switch: KillSwitchController::new(
                Arc::clone(&self.firewall),
                self.publisher.kill_switch.clone(),
            ),
            allow_lan: self.options.kill_switch.allow_lan,
            shared: Arc::clone(&self.shared),
            connectivity_tx,
            session: None,
            auto_reconnect,
            trigger: ReconnectTrigger::Manual,
            pending: None,
            connect_reply: None,
            settle: None,
            network_lost: false,
            tunnel_up: false,
        };
        let actor = tokio::spawn(actor.run(rx, cancel.clone(), self.options.kill_switch.enabled));

        let checker = Arc::clone(&self.health);
        let health_tx = tx.clone();
        let health_cancel = cancel.clone();
        let health = tokio::spawn(async move {
            checker
                .run(connectivity_rx, health_cancel, move |report| {
                    let _ = health_tx.send(Command::Health(report));
                })
                .await;
        });

        let monitor_tx = tx.clone();
        self.monitor
            .start_monitoring(move |state| {
                let _ = monitor_tx.send(Command::Connectivity(state));
            })
            .await;

        *self
            .sender
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
        self.tasks = Some(Tasks {
            cancel,
            actor,
            health,
        });
        info!("Resilience coordinator started");
    }

    /// Stop all activity and reset owned state
    ///
    /// Pending timers are cancelled, the kill switch is released and the
    /// session is forgotten. The tunnel engine itself is left as it is.
    pub async fn stop(&mut self) {
        let Some(tasks) = self.tasks.take() else {
            return;
        };

        *self
            .sender
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.monitor.stop_monitoring().await;

        tasks.cancel.cancel();
        if let Err(e) = tasks.health.await {
            warn!(error = %e, "Health check task ended abnormally");
        }
        if let Err(e) = tasks.actor.await {
            warn!(error = %e, "Coordinator task ended abnormally");
        }
        info!("Resilience coordinator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_some()
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            sender: Arc::clone(&self.sender),
            publisher: self.publisher.clone(),
            shared: Arc::clone(&self.shared),
            network: self.monitor.view(),
        }
    }
}

/// Cloneable control and query handle for a `ResilienceCoordinator`
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: Arc<RwLock<Option<mpsc::UnboundedSender<Command>>>>,
    publisher: StatusPublisher,
    shared: Arc<Mutex<Shared>>,
    network: NetworkView,
}

impl CoordinatorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        let sender = self
            .sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(CoordinatorError::NotRunning)?;

        let (reply, response) = oneshot::channel();
        sender
            .send(make(reply))
            .map_err(|_| CoordinatorError::NotRunning)?;
        response.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Target `session` and start the tunnel
    ///
    /// Resolves once the tunnel carries traffic (`true`) or the first
    /// attempt failed (`false`, retried in the background when automatic
    /// reconnection is on).
    pub async fn connect(&self, session: SessionConfig) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::Connect { session, reply })
            .await?
    }

    /// Stop the tunnel and forget the session; cancels any pending attempt
    pub async fn disconnect(&self) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Start a reconnection cycle now; `false` if one is already running
    pub async fn trigger_reconnection(&self) -> Result<bool, CoordinatorError> {
        self.request(|reply| Command::Reconnect { reply }).await?
    }

    pub async fn enable_auto_reconnection(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::SetAutoReconnect {
            enabled: true,
            reply,
        })
        .await
    }

    /// Turn automatic reconnection off; a pending attempt is cancelled
    pub async fn disable_auto_reconnection(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::SetAutoReconnect {
            enabled: false,
            reply,
        })
        .await
    }

    pub async fn enable_kill_switch(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::SetKillSwitch {
            enabled: true,
            reply,
        })
        .await?
    }

    pub async fn disable_kill_switch(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::SetKillSwitch {
            enabled: false,
            reply,
        })
        .await?
    }

    /// Clear the attempt counter and history; `failed` returns to `idle`
    pub async fn reset_retries(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Command::ResetRetries { reply }).await
    }

    pub fn subscribe_connectivity(&self) -> StatusSubscription<ConnectivityState> {
        self.publisher.connectivity.subscribe()
    }

    pub fn subscribe_health(&self) -> StatusSubscription<HealthState> {
        self.publisher.health.subscribe()
    }

    pub fn subscribe_reconnection(&self) -> StatusSubscription<ReconnectionState> {
        self.publisher.reconnection.subscribe()
    }

    pub fn subscribe_kill_switch(&self) -> StatusSubscription<KillSwitchState> {
        self.publisher.kill_switch.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.publisher.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub fn active_session(&self) -> Option<ActiveSession> {
        lock(&self.shared).session.clone()
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        lock(&self.shared).auto_reconnect
    }

    /// Last engine or kill switch error
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared).last_error.clone()
    }

    /// Resolved attempts, oldest first
    pub fn reconnection_history(&self) -> Vec<ReconnectionAttempt> {
        lock(&self.shared).history.iter().cloned().collect()
    }

    /// Attempts made since the last reset
    pub fn total_attempts(&self) -> u32 {
        lock(&self.shared).total_attempts
    }

    pub fn current_network(&self) -> Option<NetworkInfo> {
        self.network.network_info()
    }

    pub fn last_network_change(&self) -> Option<DateTime<Utc>> {
        self.network.last_change()
    }
}
