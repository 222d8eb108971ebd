//! Shared test doubles for coordinator integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use lifeline_core::config::SessionConfig;
use lifeline_core::error::{EngineError, KillSwitchError};
use lifeline_core::vpn::{
    CallbackNetworkSource, CoordinatorHandle, CoordinatorOptions, FirewallBackend,
    KillSwitchRules, NetworkInfo, NetworkSignal, ReconnectionPolicy, ResilienceCoordinator,
    StatusSnapshot, StatusSubscription, TunnelEngine, TunnelHandle, TunnelStatistics,
};
use std::collections::VecDeque;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Generous upper bound for anything a test waits on (virtual time)
pub const WAIT_LIMIT: Duration = Duration::from_secs(3600);

pub fn test_session() -> SessionConfig {
    let mut session = SessionConfig::new("test", PathBuf::from("/usr/bin/sing-box"), "tun0");
    session.endpoints = vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))];
    session
}

#[derive(Default)]
struct EngineState {
    scripted: VecDeque<Result<bool, EngineError>>,
    fallback: Option<Result<bool, EngineError>>,
    running: bool,
    starts: Vec<Instant>,
    stops: u32,
    last_error: Option<String>,
    stats_age: Duration,
    silent: bool,
}

/// In-memory tunnel engine
///
/// `start` consumes scripted results first, then repeats the fallback
/// (success when none is set).
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<EngineState>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every start fails with `Ok(false)` and the given engine error text
    pub fn failing(last_error: &str) -> Arc<Self> {
        let engine = Self::new();
        engine.set_fallback(Ok(false));
        engine.set_last_error(last_error);
        engine
    }

    pub fn script(&self, results: impl IntoIterator<Item = Result<bool, EngineError>>) {
        self.state.lock().unwrap().scripted.extend(results);
    }

    pub fn set_fallback(&self, result: Result<bool, EngineError>) {
        self.state.lock().unwrap().fallback = Some(result);
    }

    pub fn set_last_error(&self, message: &str) {
        self.state.lock().unwrap().last_error = Some(message.to_string());
    }

    /// Report counters last updated `age` ago
    pub fn set_stats_age(&self, age: Duration) {
        self.state.lock().unwrap().stats_age = age;
    }

    /// Stop reporting statistics altogether
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Mark the tunnel as running without going through `start`
    pub fn set_running(&self, running: bool) {
        self.state.lock().unwrap().running = running;
    }

    /// Simulate the tunnel dying underneath the coordinator
    pub fn kill(&self) {
        self.state.lock().unwrap().running = false;
    }

    pub fn running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().unwrap().starts.len()
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().starts.clone()
    }

    pub fn stop_count(&self) -> u32 {
        self.state.lock().unwrap().stops
    }
}

#[async_trait]
impl TunnelEngine for MockEngine {
    async fn start(&self, _session: &SessionConfig) -> Result<bool, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.starts.push(Instant::now());

        let result = state
            .scripted
            .pop_front()
            .or_else(|| state.fallback.clone())
            .unwrap_or(Ok(true));
        state.running = matches!(result, Ok(true));
        result
    }

    async fn stop(&self) -> Result<bool, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        let was_running = state.running;
        state.running = false;
        Ok(was_running)
    }

    async fn is_running(&self) -> Result<bool, EngineError> {
        Ok(self.state.lock().unwrap().running)
    }

    async fn statistics(&self) -> Result<Option<TunnelStatistics>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok((state.running && !state.silent).then(|| TunnelStatistics {
            bytes_in: 1024,
            bytes_out: 512,
            last_updated: SystemTime::now() - state.stats_age,
        }))
    }

    async fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    async fn handle(&self) -> Option<TunnelHandle> {
        self.state
            .lock()
            .unwrap()
            .running
            .then_some(TunnelHandle::Pid(4242))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallOp {
    Install,
    Remove,
}

/// One firewall call and the published state at the moment it happened
#[derive(Debug, Clone)]
pub struct FirewallCall {
    pub op: FirewallOp,
    pub observed: Option<StatusSnapshot>,
    pub engine_running: Option<bool>,
}

#[derive(Default)]
struct FirewallState {
    calls: Vec<FirewallCall>,
    installed: bool,
    fail_install: bool,
    fail_remove: bool,
    observer: Option<(CoordinatorHandle, Arc<MockEngine>)>,
}

/// Firewall backend that records calls instead of touching the OS
#[derive(Default)]
pub struct MockFirewall {
    state: Mutex<FirewallState>,
}

impl MockFirewall {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Capture the published snapshot and engine liveness on every call
    pub fn observe(&self, handle: CoordinatorHandle, engine: Arc<MockEngine>) {
        self.state.lock().unwrap().observer = Some((handle, engine));
    }

    pub fn fail_install(&self, fail: bool) {
        self.state.lock().unwrap().fail_install = fail;
    }

    pub fn fail_remove(&self, fail: bool) {
        self.state.lock().unwrap().fail_remove = fail;
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().unwrap().installed
    }

    pub fn calls(&self) -> Vec<FirewallCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn ops(&self) -> Vec<FirewallOp> {
        self.calls().into_iter().map(|call| call.op).collect()
    }

    fn record(state: &mut FirewallState, op: FirewallOp) {
        let (observed, engine_running) = match &state.observer {
            Some((handle, engine)) => (Some(handle.snapshot()), Some(engine.running())),
            None => (None, None),
        };
        state.calls.push(FirewallCall {
            op,
            observed,
            engine_running,
        });
    }
}

#[async_trait]
impl FirewallBackend for MockFirewall {
    async fn install(&self, _rules: &KillSwitchRules) -> Result<(), KillSwitchError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_install {
            return Err(KillSwitchError::InstallFailed("permission denied".to_string()));
        }
        Self::record(&mut state, FirewallOp::Install);
        state.installed = true;
        Ok(())
    }

    async fn remove(&self) -> Result<(), KillSwitchError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remove {
            return Err(KillSwitchError::RemoveFailed("permission denied".to_string()));
        }
        Self::record(&mut state, FirewallOp::Remove);
        state.installed = false;
        Ok(())
    }
}

/// Policy with a 1s initial delay doubling up to 60s
pub fn test_policy(max_attempts: u32) -> ReconnectionPolicy {
    ReconnectionPolicy::new(
        Duration::from_secs(1),
        Duration::from_secs(60),
        2.0,
        max_attempts,
    )
    .expect("Test policy should be valid")
}

/// Options that keep periodic health checks out of the way
pub fn quiet_options() -> CoordinatorOptions {
    let mut options = CoordinatorOptions::default();
    options.health.interval_secs = 24 * 3600;
    options.coordinator.settle_delay_ms = 2000;
    options.coordinator.confirm_timeout_ms = 1000;
    options
}

/// Options with a periodic health check every `interval_secs`
pub fn checked_options(interval_secs: u64) -> CoordinatorOptions {
    let mut options = quiet_options();
    options.health.interval_secs = interval_secs;
    options
}

pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub firewall: Arc<MockFirewall>,
    pub network: CallbackNetworkSource,
    pub coordinator: ResilienceCoordinator,
    pub handle: CoordinatorHandle,
}

impl Harness {
    pub fn build(
        engine: Arc<MockEngine>,
        policy: ReconnectionPolicy,
        options: CoordinatorOptions,
    ) -> Self {
        let firewall = MockFirewall::new();
        let network = CallbackNetworkSource::new();
        // Start on a validated network
        network.emit(NetworkSignal::Available(NetworkInfo::wifi("home")));

        let coordinator = ResilienceCoordinator::new(
            engine.clone(),
            firewall.clone(),
            Arc::new(network.clone()),
            policy,
            options,
        )
        .expect("Coordinator should build");
        let handle = coordinator.handle();

        Self {
            engine,
            firewall,
            network,
            coordinator,
            handle,
        }
    }

    /// Started coordinator with a connected session
    pub async fn connected(
        engine: Arc<MockEngine>,
        policy: ReconnectionPolicy,
        options: CoordinatorOptions,
    ) -> Self {
        let mut harness = Self::build(engine, policy, options);
        harness.coordinator.start().await;
        let connected = harness
            .handle
            .connect(test_session())
            .await
            .expect("Connect should be accepted");
        assert!(connected, "Initial connection should succeed");
        harness
    }

    pub fn lose_network(&self) {
        self.network.emit(NetworkSignal::Lost {
            network_id: "home".to_string(),
        });
    }

    pub fn regain_network(&self, info: NetworkInfo) {
        self.network.emit(NetworkSignal::Available(info));
    }
}

/// Receive values until one matches `predicate`; returns everything seen
pub async fn wait_for<T, F>(subscription: &mut StatusSubscription<T>, predicate: F) -> Vec<T>
where
    T: Clone + Send + std::fmt::Debug + 'static,
    F: Fn(&T) -> bool,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(WAIT_LIMIT, async {
        while let Some(value) = subscription.recv().await {
            let done = predicate(&value);
            seen.push(value);
            if done {
                return true;
            }
        }
        false
    })
    .await;

    assert!(
        matches!(result, Ok(true)),
        "Expected state never arrived, saw {:?}",
        seen
    );
    seen
}

/// Drain whatever is already buffered on a subscription
pub fn drain<T>(subscription: &mut StatusSubscription<T>) -> Vec<T>
where
    T: Clone + Send + 'static,
{
    std::iter::from_fn(|| subscription.try_recv()).collect()
}

/// Let spawned tasks run without advancing the clock much
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Run `future` with a virtual-time bound
pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    tokio::time::timeout(limit, future)
        .await
        .expect("Operation should finish in time")
}
