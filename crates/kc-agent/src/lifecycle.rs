//! Control-plane connection lifecycle.
//!
//! [`ConnectionLifecycleManager`] is the only writer of [`ConnectionState`].
//! It owns the heartbeat loop, the reconnect timer and the circuit breaker
//! cooldown, and treats heartbeat responses as server policy:
//!
//! - `should_reconnect = false` suspends the device until the next explicit
//!   [`connect`](ConnectionLifecycleManager::connect).
//! - A single failed heartbeat is only logged; the connection is considered
//!   lost once no heartbeat has succeeded for the power-state timeout.
//! - Repeated losses back off exponentially and eventually open the breaker.
//!
//! Every loop runs as a tokio task. Tasks capture the generation current when
//! they were spawned and drop their result if the manager moved on since.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use kc_common::{AgentConfig, AgentError};

use crate::api::{HeartbeatTransport, MAX_THROTTLE};
use crate::debounce::NetworkStabilityDebouncer;
use crate::power::{self, HeartbeatTiming, PowerStateProvider, ProcessPowerState};
use crate::reconnect::ReconnectPolicy;
use crate::state::{BlockedUntil, ConnectionState, Credential, HeartbeatResult};
use crate::sysinfo_collector::DeviceMetricsSource;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub policy: ReconnectPolicy,
    pub debounce_window: Duration,
    pub power_poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for LifecycleConfig {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            policy: ReconnectPolicy::from(&cfg.reconnect),
            debounce_window: Duration::from_millis(cfg.network.debounce_ms),
            power_poll_interval: Duration::from_secs(cfg.control.power_poll_secs.max(1)),
        }
    }
}

/// Failure counters, exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounters {
    pub consecutive_failures: u32,
    pub reconnect_attempt: u32,
}

#[derive(Clone)]
pub struct ConnectionLifecycleManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn HeartbeatTransport>,
    metrics: Arc<dyn DeviceMetricsSource>,
    policy: ReconnectPolicy,
    debouncer: NetworkStabilityDebouncer,
    power_rx: watch::Receiver<ProcessPowerState>,
    state_tx: watch::Sender<ConnectionState>,
    heartbeat_tx: watch::Sender<Option<HeartbeatResult>>,
    shared: Mutex<Shared>,
    /// Stability listener and power poller.
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct Shared {
    credential: Option<Credential>,
    counters: FailureCounters,
    generation: u64,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    breaker: Option<JoinHandle<()>>,
}

impl Shared {
    fn heartbeat_running(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Abort every loop and invalidate tasks that are already past their last await.
    fn cancel_loops(&mut self) {
        self.generation += 1;
        for handle in [
            self.heartbeat.take(),
            self.reconnect.take(),
            self.breaker.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

enum AfterFailure {
    Continue,
    Stop,
    Reconnect,
}

impl ConnectionLifecycleManager {
    /// Create the manager. Must be called inside a tokio runtime: the network
    /// stability listener and power poller start immediately.
    pub fn new(
        config: LifecycleConfig,
        transport: Arc<dyn HeartbeatTransport>,
        metrics: Arc<dyn DeviceMetricsSource>,
        power_provider: Arc<dyn PowerStateProvider>,
    ) -> Self {
        let (power_tx, power_rx) = watch::channel(power_provider.current());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (heartbeat_tx, _) = watch::channel(None);

        let inner = Arc::new(Inner {
            transport,
            metrics,
            policy: config.policy,
            debouncer: NetworkStabilityDebouncer::new(config.debounce_window),
            power_rx,
            state_tx,
            heartbeat_tx,
            shared: Mutex::new(Shared::default()),
            background: Mutex::new(Vec::new()),
        });

        let listener = spawn_stability_listener(Arc::downgrade(&inner));
        let poller = power::spawn_poller(power_provider, power_tx, config.power_poll_interval);
        inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([listener, poller]);

        Self { inner }
    }

    /// Store the credential and start heartbeating once the network is stable.
    ///
    /// Returns `false` without touching any state when the credential is blank.
    pub fn connect(&self, device_id: &str, token: &str) -> bool {
        let Some(credential) = Credential::new(device_id, token) else {
            tracing::warn!("connect() called without a device credential, ignoring");
            return false;
        };
        self.inner.connect(credential);
        true
    }

    /// Cancel all loops, forget the credential and go `Disconnected`. Idempotent.
    pub fn disconnect(&self, reason: &str) {
        let inner = &self.inner;
        let mut shared = inner.lock();
        shared.cancel_loops();
        shared.credential = None;
        shared.counters = FailureCounters::default();
        tracing::info!("Disconnecting: {}", reason);
        inner.set_state(ConnectionState::Disconnected);
    }

    pub fn on_network_available(&self) {
        self.inner.debouncer.signal_available();
    }

    /// Network loss disconnects immediately, keeping the credential for later.
    pub fn on_network_lost(&self) {
        let inner = &self.inner;
        inner.debouncer.signal_lost();

        let mut shared = inner.lock();
        match inner.state() {
            // Policy states survive a network drop; their own timers resume them.
            ConnectionState::ServerBlocked { .. } | ConnectionState::CircuitOpen { .. } => {}
            // A rejected credential stays rejected until connect() supplies a new one.
            ConnectionState::Error {
                retryable: false, ..
            } => {}
            ConnectionState::Disconnected if !shared.heartbeat_running() => {}
            _ => {
                shared.cancel_loops();
                shared.counters = FailureCounters::default();
                tracing::info!("Network lost, dropping control-plane connection");
                inner.set_state(ConnectionState::Disconnected);
            }
        }
    }

    /// Schedule a reconnect if every guard allows it. Returns whether one was scheduled.
    pub fn consider_reconnect(&self, reason: &str) -> bool {
        self.inner.consider_reconnect(reason)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Last server policy received, `None` until the first successful heartbeat.
    pub fn heartbeat_results(&self) -> watch::Receiver<Option<HeartbeatResult>> {
        self.inner.heartbeat_tx.subscribe()
    }

    pub fn is_network_stable(&self) -> bool {
        self.inner.debouncer.is_stable()
    }

    pub fn counters(&self) -> FailureCounters {
        self.inner.lock().counters
    }

    /// Disconnect and stop the stability listener and power poller.
    pub fn shutdown(&self) {
        self.disconnect("shutdown");
        self.inner.debouncer.cancel();
        for handle in self
            .inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next.clone());
        if prev.label() != next.label() {
            tracing::info!("Connection state: {} → {}", prev, next);
        }
    }

    fn connect(self: &Arc<Self>, credential: Credential) {
        let mut shared = self.lock();
        let state = self.state();
        let now = Instant::now();

        if shared.credential.as_ref() == Some(&credential) && state.is_active() {
            tracing::debug!("connect() while {}, nothing to do", state);
            return;
        }

        if let ConnectionState::ServerBlocked {
            until: BlockedUntil::At(deadline),
        } = state
        {
            if deadline > now {
                // The resume timer stays armed and picks up the new credential.
                tracing::info!(
                    "Server asked to back off for another {}s, deferring connect",
                    (deadline - now).as_secs()
                );
                shared.credential = Some(credential);
                shared.counters = FailureCounters::default();
                return;
            }
        }

        shared.cancel_loops();
        shared.credential = Some(credential);
        shared.counters = FailureCounters::default();

        if !self.debouncer.is_stable() {
            tracing::info!("Credential stored, waiting for a stable network before connecting");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.set_state(ConnectionState::Connecting);
        self.start_heartbeat(&mut shared);
    }

    fn start_heartbeat(self: &Arc<Self>, shared: &mut Shared) {
        let Some(credential) = shared.credential.clone() else {
            return;
        };
        if shared.heartbeat_running() {
            return;
        }

        shared.generation += 1;
        let generation = shared.generation;
        let inner = Arc::clone(self);
        shared.heartbeat = Some(tokio::spawn(async move {
            inner.heartbeat_loop(generation, credential).await;
        }));
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64, credential: Credential) {
        let mut last_success = Instant::now();
        tracing::debug!(device_id = %credential.device_id, "Heartbeat loop started");

        loop {
            let timing = self.power_rx.borrow().heartbeat_timing();
            let request = self.metrics.collect().await;

            let outcome = match tokio::time::timeout(
                timing.timeout,
                self.transport.heartbeat(&credential, &request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout),
            };

            match outcome {
                Ok(result) => {
                    last_success = Instant::now();
                    if self.on_heartbeat_success(generation, result).is_break() {
                        return;
                    }
                }
                Err(e) => {
                    match self.on_heartbeat_failure(generation, &e, last_success.elapsed(), timing)
                    {
                        AfterFailure::Continue => {}
                        AfterFailure::Stop => return,
                        AfterFailure::Reconnect => {
                            self.consider_reconnect("heartbeat timeout");
                            return;
                        }
                    }
                }
            }

            tokio::time::sleep(timing.interval).await;
        }
    }

    fn on_heartbeat_success(&self, generation: u64, result: HeartbeatResult) -> ControlFlow<()> {
        let mut shared = self.lock();
        if shared.generation != generation {
            return ControlFlow::Break(());
        }

        shared.counters = FailureCounters::default();
        if let Some(breaker) = shared.breaker.take() {
            breaker.abort();
        }
        self.heartbeat_tx.send_replace(Some(result));

        if !result.should_reconnect {
            tracing::warn!("Server directed this device to stop reconnecting");
            shared.heartbeat = None;
            self.set_state(ConnectionState::ServerBlocked {
                until: BlockedUntil::Indefinite,
            });
            return ControlFlow::Break(());
        }

        if !self.state().is_connected() {
            self.set_state(ConnectionState::Connected {
                since: Instant::now(),
            });
        }
        tracing::debug!(
            remote_control = result.remote_control_enabled,
            "Heartbeat acknowledged"
        );
        ControlFlow::Continue(())
    }

    fn on_heartbeat_failure(
        self: &Arc<Self>,
        generation: u64,
        error: &AgentError,
        since_success: Duration,
        timing: HeartbeatTiming,
    ) -> AfterFailure {
        let mut shared = self.lock();
        if shared.generation != generation {
            return AfterFailure::Stop;
        }
        shared.counters.consecutive_failures += 1;
        let failures = shared.counters.consecutive_failures;

        match error {
            AgentError::Throttled(wait) => {
                let wait = (*wait).min(MAX_THROTTLE);
                tracing::warn!("Heartbeat throttled, pausing for {}s", wait.as_secs());
                shared.heartbeat = None;
                let now = Instant::now();
                let until = now
                    .checked_add(wait)
                    .unwrap_or_else(|| now + MAX_THROTTLE);
                self.block_until(&mut shared, until);
                AfterFailure::Stop
            }
            e if !e.is_retryable() => {
                tracing::error!("Heartbeat rejected, not retrying: {}", e);
                shared.heartbeat = None;
                self.set_state(ConnectionState::Error {
                    message: e.to_string(),
                    retryable: false,
                });
                AfterFailure::Stop
            }
            _ if since_success < timing.timeout => {
                tracing::warn!(
                    "Heartbeat failed ({} in a row, {}s since last success): {}",
                    failures,
                    since_success.as_secs(),
                    error
                );
                AfterFailure::Continue
            }
            _ => {
                tracing::warn!(
                    "No successful heartbeat for {}s ({} failures), connection lost: {}",
                    since_success.as_secs(),
                    failures,
                    error
                );
                shared.heartbeat = None;
                self.set_state(ConnectionState::Error {
                    message: format!(
                        "no successful heartbeat for {}s",
                        since_success.as_secs()
                    ),
                    retryable: true,
                });
                if self.policy.should_open_breaker(failures) {
                    self.open_circuit(&mut shared, "consecutive heartbeat failures");
                    AfterFailure::Stop
                } else {
                    AfterFailure::Reconnect
                }
            }
        }
    }

    /// Enter a timed server block and arm a timer that reconsiders afterwards.
    fn block_until(self: &Arc<Self>, shared: &mut Shared, deadline: Instant) {
        if let Some(prev) = shared.reconnect.take() {
            prev.abort();
        }
        self.set_state(ConnectionState::ServerBlocked {
            until: BlockedUntil::At(deadline),
        });

        let generation = shared.generation;
        let inner = Arc::clone(self);
        shared.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut shared = inner.lock();
                if shared.generation != generation {
                    return;
                }
                shared.reconnect = None;
            }
            inner.consider_reconnect("server block expired");
        }));
    }

    fn consider_reconnect(self: &Arc<Self>, reason: &str) -> bool {
        let mut shared = self.lock();
        let state = self.state();
        let now = Instant::now();

        if state.is_blocked_at(now) {
            tracing::debug!("Not reconnecting ({}): blocked by server", reason);
            return false;
        }
        if matches!(state, ConnectionState::CircuitOpen { .. }) {
            tracing::debug!("Not reconnecting ({}): circuit breaker open", reason);
            return false;
        }
        if state.is_active() {
            tracing::debug!("Not reconnecting ({}): already {}", reason, state);
            return false;
        }
        if !self.debouncer.is_stable() {
            tracing::info!("Not reconnecting ({}): network not stable", reason);
            if matches!(state, ConnectionState::ServerBlocked { .. }) {
                self.set_state(ConnectionState::Disconnected);
            }
            return false;
        }
        if shared.credential.is_none() {
            tracing::debug!("Not reconnecting ({}): no credential", reason);
            return false;
        }
        if self
            .policy
            .attempts_exhausted(shared.counters.reconnect_attempt)
        {
            self.open_circuit(&mut shared, "reconnect attempts exhausted");
            return false;
        }

        shared.counters.reconnect_attempt += 1;
        let attempt = shared.counters.reconnect_attempt;
        let delay = self.policy.delay_with_jitter(attempt);

        if let Some(prev) = shared.reconnect.take() {
            prev.abort();
        }
        tracing::info!(
            "Reconnecting in {:.1}s (attempt {}/{}): {}",
            delay.as_secs_f64(),
            attempt,
            self.policy.max_attempts,
            reason
        );
        self.set_state(ConnectionState::Reconnecting {
            attempt,
            next_attempt_at: now + delay,
        });

        let generation = shared.generation;
        let inner = Arc::clone(self);
        shared.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire_reconnect(generation, attempt);
        }));
        true
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64, attempt: u32) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        shared.reconnect = None;

        match self.state() {
            ConnectionState::Reconnecting { attempt: a, .. } if a == attempt => {}
            _ => return,
        }
        if !self.debouncer.is_stable() || shared.credential.is_none() {
            tracing::info!("Reconnect attempt {} deferred until the network is stable", attempt);
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.set_state(ConnectionState::Connecting);
        self.start_heartbeat(&mut shared);
    }

    fn open_circuit(self: &Arc<Self>, shared: &mut Shared, reason: &str) {
        for handle in [shared.heartbeat.take(), shared.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        if let Some(prev) = shared.breaker.take() {
            prev.abort();
        }

        let cooldown = self.policy.breaker_cooldown;
        tracing::warn!(
            "Circuit breaker open ({}), pausing for {}s",
            reason,
            cooldown.as_secs()
        );
        self.set_state(ConnectionState::CircuitOpen {
            since: Instant::now(),
        });

        let generation = shared.generation;
        let inner = Arc::clone(self);
        shared.breaker = Some(tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            inner.reset_circuit(generation);
        }));
    }

    fn reset_circuit(self: &Arc<Self>, generation: u64) {
        {
            let mut shared = self.lock();
            if shared.generation != generation {
                return;
            }
            shared.breaker = None;
            if !matches!(self.state(), ConnectionState::CircuitOpen { .. }) {
                return;
            }
            shared.counters = FailureCounters::default();
            tracing::info!("Circuit breaker cooldown elapsed");
            self.set_state(ConnectionState::Disconnected);
        }
        self.consider_reconnect("circuit breaker reset");
    }

    /// Debounced "network stable" edge.
    fn on_network_stable(self: &Arc<Self>) {
        let state = {
            let mut shared = self.lock();
            if shared.credential.is_none() {
                return;
            }
            let state = self.state();
            if matches!(state, ConnectionState::Disconnected) && !shared.heartbeat_running() {
                tracing::info!("Network stable, starting heartbeat");
                self.set_state(ConnectionState::Connecting);
                self.start_heartbeat(&mut shared);
                return;
            }
            state
        };

        if matches!(
            state,
            ConnectionState::Error { retryable: true, .. } | ConnectionState::ServerBlocked { .. }
        ) {
            self.consider_reconnect("network stable");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(|e| e.into_inner());
        shared.cancel_loops();
        for handle in self
            .background
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
    }
}

fn spawn_stability_listener(inner: Weak<Inner>) -> JoinHandle<()> {
    let Some(mut rx) = inner.upgrade().map(|i| i.debouncer.subscribe()) else {
        return tokio::spawn(async {});
    };

    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if !*rx.borrow_and_update() {
                continue;
            }
            match inner.upgrade() {
                Some(inner) => inner.on_network_stable(),
                None => break,
            }
        }
    })
}
