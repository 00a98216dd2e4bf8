//! Streaming session to the screen relay.
//!
//! Opens a WebSocket to the relay, authenticates as a device, then runs a
//! single select loop per connection that:
//! 1. dispatches inbound control/input messages to the collaborators
//! 2. sends a JSON ping every `ping_interval` and tracks round-trip time
//! 3. drains the frame queue, shedding frames per [`DropPolicy`]
//! 4. drops the connection when no pong arrives within `pong_timeout`
//!
//! A supervisor task reconnects with exponential backoff until
//! [`StreamingSession::disconnect`]. An authentication rejection ends the
//! supervisor: the same credential is not retried.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use kc_common::config::StreamingConfig;
use kc_protocol::{
    decode_inbound, ClientMessage, ControlAction, Inbound, ServerMessage, DEFAULT_FRAME_QUEUE_CAPACITY,
    DEVICE_ROLE, LEGACY_PONG,
};

use crate::collaborators::{
    AlwaysHealthy, CaptureController, InputInjector, LoggingInputInjector, NoopCapture,
    StreamHealth,
};
use crate::frame_queue::{DropPolicy, FrameBackpressureQueue, QueuedFrame};
use crate::state::StreamingConnectionState;

#[derive(Debug, Clone)]
pub struct StreamingOptions {
    pub device_name: String,
    pub os_version: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Bounds both the WebSocket connect and the wait for `authenticated`.
    pub auth_timeout: Duration,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub queue_capacity: usize,
    pub max_consecutive_drops: u32,
    /// Queued frames older than this are shed. Zero keeps them.
    pub max_frame_age: Duration,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self::from_config(&StreamingConfig::default(), "kiosk".into(), "unknown".into())
    }
}

impl StreamingOptions {
    pub fn from_config(cfg: &StreamingConfig, device_name: String, os_version: String) -> Self {
        Self {
            device_name: cfg.device_name.clone().unwrap_or(device_name),
            os_version,
            ping_interval: Duration::from_secs(cfg.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(cfg.pong_timeout_secs.max(1)),
            auth_timeout: Duration::from_secs(cfg.auth_timeout_secs.max(1)),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            backoff_multiplier: cfg.backoff_multiplier.max(1.0),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            queue_capacity: if cfg.queue_capacity == 0 {
                DEFAULT_FRAME_QUEUE_CAPACITY
            } else {
                cfg.queue_capacity
            },
            max_consecutive_drops: cfg.max_consecutive_drops,
            max_frame_age: Duration::from_millis(cfg.max_frame_age_ms),
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_multiplier).min(self.max_backoff)
    }
}

/// External collaborators the session dispatches to.
#[derive(Clone)]
pub struct Collaborators {
    pub input: Arc<dyn InputInjector>,
    pub capture: Arc<dyn CaptureController>,
    pub health: Arc<dyn StreamHealth>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            input: Arc::new(LoggingInputInjector),
            capture: Arc::new(NoopCapture),
            health: Arc::new(AlwaysHealthy),
        }
    }
}

/// Snapshot of streaming counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_queued: u64,
    pub frames_sent: u64,
    /// Shed by the drop policy, failed to send, or evicted on overflow.
    pub frames_dropped: u64,
    pub consecutive_drops: u32,
    pub last_rtt: Option<Duration>,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    consecutive_drops: AtomicU32,
    /// 0 = no sample yet
    rtt_micros: AtomicU64,
}

#[derive(Clone)]
struct Target {
    url: String,
    token: String,
    device_id: String,
    /// Session generation this supervisor belongs to.
    generation: u64,
}

#[derive(Clone)]
pub struct StreamingSession {
    inner: Arc<Inner>,
}

struct Inner {
    options: StreamingOptions,
    collaborators: Collaborators,
    queue: FrameBackpressureQueue,
    state_tx: watch::Sender<StreamingConnectionState>,
    authenticated: AtomicBool,
    shut_down: AtomicBool,
    /// Bumped by `disconnect` so an aborted supervisor cannot publish state.
    generation: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

/// Why a single connection ended.
#[derive(Debug, PartialEq)]
enum SessionEnd {
    AuthRejected(String),
    Closed { reason: String, authenticated: bool },
}

impl StreamingSession {
    pub fn new(options: StreamingOptions, collaborators: Collaborators) -> Self {
        let (state_tx, _) = watch::channel(StreamingConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                queue: FrameBackpressureQueue::new(options.queue_capacity),
                options,
                collaborators,
                state_tx,
                authenticated: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                supervisor: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Start the supervised connection. A no-op while a session is already running.
    pub fn connect(&self, url: &str, token: &str, device_id: &str) -> bool {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            tracing::warn!("Streaming session is shut down, ignoring connect");
            return false;
        }
        if [url, token, device_id].iter().any(|s| s.trim().is_empty()) {
            tracing::warn!("Streaming connect() needs a URL, token and device ID");
            return false;
        }

        let mut supervisor = inner.supervisor_slot();
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("Streaming session already running");
            return true;
        }

        let target = Target {
            url: url.to_string(),
            token: token.to_string(),
            device_id: device_id.to_string(),
            generation: inner.generation.load(Ordering::SeqCst),
        };
        inner.set_state(StreamingConnectionState::Connecting);
        let task_inner = Arc::clone(inner);
        *supervisor = Some(tokio::spawn(async move {
            task_inner.supervise(target).await;
        }));
        true
    }

    /// Cancel every loop, discard queued frames and go `Disconnected`.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = inner.supervisor_slot().take() {
            handle.abort();
            tracing::info!("Streaming session stopped");
        }
        inner.authenticated.store(false, Ordering::SeqCst);
        inner.queue.clear();
        inner.set_state(StreamingConnectionState::Disconnected);
    }

    /// Disconnect and refuse further connects.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.disconnect();
    }

    /// Offer an encoded frame. Returns `false` when no authenticated link
    /// exists and the frame was discarded.
    pub fn queue_frame(&self, bytes: Vec<u8>) -> bool {
        let inner = &self.inner;
        if !inner.authenticated.load(Ordering::SeqCst) {
            return false;
        }
        inner.counters.queued.fetch_add(1, Ordering::Relaxed);
        if inner.queue.push(QueuedFrame::new(bytes)).is_some() {
            inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StreamingConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamingConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn stats(&self) -> StreamStats {
        let c = &self.inner.counters;
        let rtt = c.rtt_micros.load(Ordering::Relaxed);
        StreamStats {
            frames_queued: c.queued.load(Ordering::Relaxed),
            frames_sent: c.sent.load(Ordering::Relaxed),
            frames_dropped: c.dropped.load(Ordering::Relaxed),
            consecutive_drops: c.consecutive_drops.load(Ordering::Relaxed),
            last_rtt: (rtt > 0).then(|| Duration::from_micros(rtt)),
        }
    }
}

impl Inner {
    fn supervisor_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: StreamingConnectionState) {
        let prev = self.state_tx.send_replace(next.clone());
        if prev != next {
            tracing::info!("Streaming state: {:?} → {:?}", prev, next);
        }
    }

    /// Publish state on behalf of a supervisor, unless it has been superseded.
    fn publish(&self, target: &Target, next: StreamingConnectionState) -> bool {
        if self.generation.load(Ordering::SeqCst) != target.generation {
            return false;
        }
        if !matches!(next, StreamingConnectionState::Connected) {
            self.authenticated.store(false, Ordering::SeqCst);
        }
        self.set_state(next);
        true
    }

    async fn supervise(self: Arc<Self>, target: Target) {
        let mut backoff = self.options.initial_backoff;

        loop {
            if !self.publish(&target, StreamingConnectionState::Connecting) {
                return;
            }
            let end = self.run_connection(&target).await;

            match end {
                SessionEnd::AuthRejected(message) => {
                    tracing::error!("Relay rejected device authentication: {}", message);
                    self.queue.clear();
                    self.publish(&target, StreamingConnectionState::Disconnected);
                    return;
                }
                SessionEnd::Closed {
                    reason,
                    authenticated,
                } => {
                    if authenticated {
                        backoff = self.options.initial_backoff;
                    }
                    tracing::warn!(
                        "Streaming connection ended: {} (retry in {}ms)",
                        reason,
                        backoff.as_millis()
                    );
                    // Error until an attempt authenticates again.
                    let next = if authenticated {
                        StreamingConnectionState::Reconnecting
                    } else {
                        StreamingConnectionState::Error(reason)
                    };
                    if !self.publish(&target, next) {
                        return;
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = self.options.next_backoff(backoff);
        }
    }

    async fn run_connection(&self, target: &Target) -> SessionEnd {
        let closed = |reason: String, authenticated: bool| SessionEnd::Closed {
            reason,
            authenticated,
        };

        let ws_stream =
            match tokio::time::timeout(self.options.auth_timeout, connect_async(target.url.as_str()))
                .await
            {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => return closed(format!("connect failed: {}", e), false),
                Err(_) => return closed("connect timed out".into(), false),
            };
        tracing::info!("Relay WebSocket connected: {}", target.url);

        let (mut ws_write, mut ws_read) = ws_stream.split();

        let auth = ClientMessage::Authenticate {
            role: DEVICE_ROLE.to_string(),
            device_id: target.device_id.clone(),
            token: target.token.clone(),
            device_name: self.options.device_name.clone(),
            os_version: self.options.os_version.clone(),
        };
        match auth.to_json() {
            Ok(json) => {
                if let Err(e) = ws_write.send(Message::Text(json)).await {
                    return closed(format!("authenticate send failed: {}", e), false);
                }
            }
            Err(e) => return closed(format!("authenticate encode failed: {}", e), false),
        }

        let mut link = LinkState::new(self.options.auth_timeout);
        let mut policy = DropPolicy::new(self.queue.capacity(), self.options.max_consecutive_drops)
            .with_max_age(self.options.max_frame_age);
        let mut ping = tokio::time::interval_at(
            Instant::now() + self.options.ping_interval,
            self.options.ping_interval,
        );
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = link.deadline(self.options.pong_timeout);

            tokio::select! {
                msg = ws_read.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return closed(format!("read error: {}", e), link.authenticated),
                        None => return closed("stream ended".into(), link.authenticated),
                    };

                    let reply = match msg {
                        Message::Text(text) => match link.handle_text(self, &text) {
                            LinkAction::None => None,
                            LinkAction::Reply(reply) => Some(Message::Text(reply)),
                            LinkAction::Authenticated => {
                                self.authenticated.store(true, Ordering::SeqCst);
                                if !self.publish(target, StreamingConnectionState::Connected) {
                                    self.authenticated.store(false, Ordering::SeqCst);
                                    return closed("session superseded".into(), false);
                                }
                                ping.reset();
                                tracing::info!("Relay authenticated device {}", target.device_id);
                                None
                            }
                            LinkAction::Rejected(message) => {
                                let _ = ws_write.send(Message::Close(None)).await;
                                return SessionEnd::AuthRejected(message);
                            }
                        },
                        // tungstenite queues the pong reply itself
                        Message::Ping(_) => None,
                        Message::Pong(_) => {
                            link.on_pong(self, None);
                            None
                        }
                        Message::Close(_) => {
                            return closed("closed by relay".into(), link.authenticated);
                        }
                        _ => None,
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = ws_write.send(reply).await {
                            return closed(format!("write error: {}", e), link.authenticated);
                        }
                    }
                }

                _ = ping.tick(), if link.authenticated => {
                    let timestamp = link.start_ping();
                    let json = match (ClientMessage::Ping { timestamp }).to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("Failed to encode ping: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_write.send(Message::Text(json)).await {
                        return closed(format!("ping send failed: {}", e), true);
                    }
                    tracing::trace!(timestamp, "Ping sent");
                }

                frame = self.queue.pop(), if link.authenticated => {
                    if policy.drop_if_stale(&frame) {
                        self.record_drop(&policy);
                        tracing::trace!(
                            age_ms = frame.enqueued_at.elapsed().as_millis() as u64,
                            "Stale frame dropped"
                        );
                        continue;
                    }
                    let depth = self.queue.len();
                    let unhealthy = self.collaborators.health.should_drop();
                    if policy.should_drop(depth, unhealthy) {
                        self.record_drop(&policy);
                        tracing::trace!(depth, unhealthy, "Frame dropped");
                        continue;
                    }

                    let sent = match self.encode_frame(&frame) {
                        Ok(json) => ws_write.send(Message::Text(json)).await.map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    match sent {
                        Ok(()) => {
                            self.counters.sent.fetch_add(1, Ordering::Relaxed);
                            self.counters.consecutive_drops.store(0, Ordering::Relaxed);
                            tracing::trace!(
                                age_ms = frame.enqueued_at.elapsed().as_millis() as u64,
                                "Frame sent"
                            );
                        }
                        Err(e) => {
                            policy.record_send_failure();
                            self.record_drop(&policy);
                            tracing::debug!("Frame send failed, counted as drop: {}", e);
                        }
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    return if link.authenticated {
                        closed(
                            format!("no pong for {}s", self.options.pong_timeout.as_secs()),
                            true,
                        )
                    } else {
                        closed("authentication timed out".into(), false)
                    };
                }
            }
        }
    }

    fn encode_frame(&self, frame: &QueuedFrame) -> Result<String, serde_json::Error> {
        let capture = &self.collaborators.capture;
        ClientMessage::Frame {
            format: frame.format,
            data: base64::engine::general_purpose::STANDARD.encode(&frame.bytes),
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_keyframe: frame.is_keyframe,
            quality: capture.current_quality(),
            fps: capture.current_fps(),
        }
        .to_json()
    }

    fn record_drop(&self, policy: &DropPolicy) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        self.counters
            .consecutive_drops
            .store(policy.consecutive_drops(), Ordering::Relaxed);
    }

    fn record_rtt(&self, rtt: Duration) {
        self.counters
            .rtt_micros
            .store((rtt.as_micros() as u64).max(1), Ordering::Relaxed);
        self.collaborators.health.record_rtt(rtt);
    }

    fn dispatch_control(&self, action: ControlAction) {
        let capture = &self.collaborators.capture;
        match action {
            ControlAction::StopCapture => {
                tracing::info!("Relay requested stop_capture");
                capture.stop_capture();
            }
            ControlAction::AdjustQuality(quality) => {
                tracing::info!(quality, "Relay requested quality change");
                capture.adjust_quality(quality);
            }
            ControlAction::AdjustFps(fps) => {
                tracing::info!(fps, "Relay requested FPS change");
                capture.adjust_fps(fps);
            }
            ControlAction::Unsupported(action) => {
                tracing::warn!("Ignoring unsupported control action: {}", action);
            }
        }
    }
}

enum LinkAction {
    None,
    Reply(String),
    Authenticated,
    Rejected(String),
}

/// Per-connection handshake and liveness bookkeeping.
struct LinkState {
    authenticated: bool,
    auth_deadline: Instant,
    last_pong: Instant,
    /// Timestamp and send time of the outstanding ping.
    outstanding_ping: Option<(i64, Instant)>,
}

impl LinkState {
    fn new(auth_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            authenticated: false,
            auth_deadline: now + auth_timeout,
            last_pong: now,
            outstanding_ping: None,
        }
    }

    fn deadline(&self, pong_timeout: Duration) -> Instant {
        if self.authenticated {
            self.last_pong + pong_timeout
        } else {
            self.auth_deadline
        }
    }

    fn start_ping(&mut self) -> i64 {
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.outstanding_ping = Some((timestamp, Instant::now()));
        timestamp
    }

    fn on_pong(&mut self, inner: &Inner, echoed: Option<i64>) {
        self.last_pong = Instant::now();
        if let Some((sent_ts, sent_at)) = self.outstanding_ping {
            if echoed.map_or(true, |ts| ts == sent_ts) {
                self.outstanding_ping = None;
                let rtt = sent_at.elapsed();
                tracing::trace!(rtt_ms = rtt.as_millis() as u64, "Pong received");
                inner.record_rtt(rtt);
            }
        }
    }

    fn handle_text(&mut self, inner: &Inner, text: &str) -> LinkAction {
        let inbound = match decode_inbound(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!("Ignoring malformed relay message: {}", e);
                return LinkAction::None;
            }
        };

        let message = match inbound {
            Inbound::LegacyPing => return LinkAction::Reply(LEGACY_PONG.to_string()),
            Inbound::LegacyPong => {
                self.on_pong(inner, None);
                return LinkAction::None;
            }
            Inbound::Message(message) => message,
        };

        match message {
            ServerMessage::Authenticated | ServerMessage::AuthSuccess => {
                if self.authenticated {
                    return LinkAction::None;
                }
                self.authenticated = true;
                self.last_pong = Instant::now();
                LinkAction::Authenticated
            }
            ServerMessage::AuthFailed { message } => {
                LinkAction::Rejected(message.unwrap_or_else(|| "auth_failed".into()))
            }
            ServerMessage::Error { message } if !self.authenticated => {
                LinkAction::Rejected(message.unwrap_or_else(|| "error".into()))
            }
            ServerMessage::Error { message } => {
                tracing::warn!(
                    "Relay reported an error: {}",
                    message.as_deref().unwrap_or("unspecified")
                );
                LinkAction::None
            }
            ServerMessage::Ping { timestamp } => (ClientMessage::Pong { timestamp })
                .to_json()
                .map(LinkAction::Reply)
                .unwrap_or(LinkAction::None),
            ServerMessage::Pong { timestamp } => {
                self.on_pong(inner, timestamp);
                LinkAction::None
            }
            ServerMessage::InputCommand { command } if self.authenticated => {
                inner.collaborators.input.inject(&command);
                LinkAction::None
            }
            ServerMessage::ControlCommand(cmd) if self.authenticated => {
                inner.dispatch_control(cmd.action());
                LinkAction::None
            }
            ServerMessage::InputCommand { .. } | ServerMessage::ControlCommand(_) => {
                tracing::warn!("Ignoring command received before authentication");
                LinkAction::None
            }
            ServerMessage::Unknown => {
                tracing::debug!("Ignoring unknown relay message: {}", text);
                LinkAction::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    type ServerWs = WebSocketStream<TcpStream>;

    #[derive(Default)]
    struct Recorder {
        inputs: Mutex<Vec<Value>>,
        controls: Mutex<Vec<String>>,
        unhealthy: AtomicBool,
        /// Blocks the session loop inside `inject` for this many milliseconds.
        inject_stall_ms: AtomicU64,
    }

    impl InputInjector for Recorder {
        fn inject(&self, command: &Value) {
            self.inputs.lock().unwrap().push(command.clone());
            let stall = self.inject_stall_ms.load(Ordering::SeqCst);
            if stall > 0 {
                std::thread::sleep(Duration::from_millis(stall));
            }
        }
    }

    impl CaptureController for Recorder {
        fn stop_capture(&self) {
            self.controls.lock().unwrap().push("stop".into());
        }
        fn adjust_quality(&self, quality: u8) {
            self.controls.lock().unwrap().push(format!("quality={}", quality));
        }
        fn adjust_fps(&self, fps: u32) {
            self.controls.lock().unwrap().push(format!("fps={}", fps));
        }
        fn current_quality(&self) -> Option<u8> {
            Some(70)
        }
    }

    impl StreamHealth for Recorder {
        fn should_drop(&self) -> bool {
            self.unhealthy.load(Ordering::SeqCst)
        }
    }

    fn options() -> StreamingOptions {
        StreamingOptions {
            device_name: "lobby-kiosk".into(),
            os_version: "test-os".into(),
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(45),
            auth_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(200),
            queue_capacity: 5,
            max_consecutive_drops: 5,
            max_frame_age: Duration::from_secs(2),
        }
    }

    fn session_with(options: StreamingOptions) -> (StreamingSession, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let collaborators = Collaborators {
            input: recorder.clone(),
            capture: recorder.clone(),
            health: recorder.clone(),
        };
        (StreamingSession::new(options, collaborators), recorder)
    }

    /// Loopback relay: runs `handler` for every accepted connection.
    async fn spawn_relay<F, Fut>(handler: F) -> (String, Arc<AtomicUsize>)
    where
        F: Fn(ServerWs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = accepted.clone();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        (*handler)(ws).await;
                    }
                });
            }
        });
        (url, accepted)
    }

    async fn next_json(ws: &mut ServerWs) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("relay stream ended: {:?}", other),
            }
        }
    }

    async fn accept_device(ws: &mut ServerWs) -> Value {
        let auth = next_json(ws).await;
        ws.send(Message::Text(json!({"type": "authenticated"}).to_string()))
            .await
            .unwrap();
        auth
    }

    async fn wait_state(session: &StreamingSession, want: StreamingConnectionState) {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("streaming state not reached")
            .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn authenticates_before_reporting_connected() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (url, _) = spawn_relay(move |mut ws| {
            let tx = tx.clone();
            async move {
                let auth = accept_device(&mut ws).await;
                tx.send(auth).unwrap();
                while ws.next().await.is_some() {}
            }
        })
        .await;

        let (session, _) = session_with(options());
        assert!(!session.queue_frame(vec![0xFF, 0xD8, 1]));
        assert!(session.connect(&url, "tok-1", "kiosk-9"));
        wait_state(&session, StreamingConnectionState::Connected).await;
        assert!(session.is_authenticated());

        let auth = rx.recv().await.unwrap();
        assert_eq!(auth["type"], "authenticate");
        assert_eq!(auth["role"], "device");
        assert_eq!(auth["deviceId"], "kiosk-9");
        assert_eq!(auth["token"], "tok-1");
        assert_eq!(auth["deviceName"], "lobby-kiosk");
        assert_eq!(auth["osVersion"], "test-os");

        session.disconnect();
        assert_eq!(session.state(), StreamingConnectionState::Disconnected);
        assert!(!session.queue_frame(vec![0xFF, 0xD8, 2]));
    }

    #[tokio::test]
    async fn auth_failure_is_terminal() {
        let (url, accepted) = spawn_relay(|mut ws| async move {
            let _ = next_json(&mut ws).await;
            let _ = ws
                .send(Message::Text(
                    json!({"type": "auth_failed", "message": "unknown device"}).to_string(),
                ))
                .await;
            while ws.next().await.is_some() {}
        })
        .await;

        let (session, _) = session_with(options());
        let mut states = session.subscribe();
        session.connect(&url, "bad", "kiosk-9");

        wait_state(&session, StreamingConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(!session.is_authenticated());
        assert_ne!(*states.borrow_and_update(), StreamingConnectionState::Connected);
        assert_eq!(session.state(), StreamingConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn error_during_handshake_disconnects() {
        let (url, accepted) = spawn_relay(|mut ws| async move {
            let _ = next_json(&mut ws).await;
            let _ = ws
                .send(Message::Text(json!({"type": "error", "message": "expired"}).to_string()))
                .await;
            while ws.next().await.is_some() {}
        })
        .await;

        let (session, _) = session_with(options());
        session.connect(&url, "tok", "kiosk-9");
        eventually(|| accepted.load(Ordering::SeqCst) == 1).await;
        wait_state(&session, StreamingConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_frames_reach_the_relay() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (url, _) = spawn_relay(move |mut ws| {
            let tx = tx.clone();
            async move {
                accept_device(&mut ws).await;
                loop {
                    let msg = next_json(&mut ws).await;
                    if msg["type"] == "frame" {
                        tx.send(msg).unwrap();
                    }
                }
            }
        })
        .await;

        let (session, _) = session_with(options());
        session.connect(&url, "tok", "kiosk-9");
        wait_state(&session, StreamingConnectionState::Connected).await;

        let jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x10];
        assert!(session.queue_frame(jpeg.clone()));
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame["format"], "jpeg");
        assert_eq!(frame["quality"], 70);
        assert!(frame.get("is_keyframe").is_none());
        let data = base64::engine::general_purpose::STANDARD
            .decode(frame["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(data, jpeg);

        assert!(session.queue_frame(vec![0, 0, 0, 1, 0x65, 0x88]));
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame["format"], "h264");
        assert_eq!(frame["is_keyframe"], true);

        eventually(|| session.stats().frames_sent == 2).await;
        session.disconnect();
    }

    #[tokio::test]
    async fn unhealthy_link_sheds_frames() {
        let (url, _) = spawn_relay(|mut ws| async move {
            accept_device(&mut ws).await;
            while ws.next().await.is_some() {}
        })
        .await;

        let (session, recorder) = session_with(options());
        session.connect(&url, "tok", "kiosk-9");
        wait_state(&session, StreamingConnectionState::Connected).await;

        recorder.unhealthy.store(true, Ordering::SeqCst);
        for i in 0..3 {
            assert!(session.queue_frame(vec![0xFF, 0xD8, i]));
        }
        eventually(|| session.stats().frames_dropped == 3).await;
        assert_eq!(session.stats().frames_sent, 0);
        session.disconnect();
    }

    #[tokio::test]
    async fn dispatches_inbound_commands() {
        let (url, _) = spawn_relay(|mut ws| async move {
            accept_device(&mut ws).await;
            for msg in [
                json!({"type": "input_command", "command": {"kind": "tap", "x": 0.5, "y": 0.25}}),
                json!({"type": "control_command", "action": "adjust_quality", "quality": 35}),
                json!({"type": "control_command", "action": "adjust_fps", "params": {"fps": 10}}),
                json!({"type": "viewer_count", "count": 2}),
                json!({"type": "control_command", "action": "stop_capture"}),
            ] {
                ws.send(Message::Text(msg.to_string())).await.unwrap();
            }
            while ws.next().await.is_some() {}
        })
        .await;

        let (session, recorder) = session_with(options());
        session.connect(&url, "tok", "kiosk-9");

        eventually(|| recorder.controls.lock().unwrap().len() == 3).await;
        assert_eq!(
            *recorder.controls.lock().unwrap(),
            vec!["quality=35", "fps=10", "stop"]
        );
        assert_eq!(
            *recorder.inputs.lock().unwrap(),
            vec![json!({"kind": "tap", "x": 0.5, "y": 0.25})]
        );
        assert_eq!(session.state(), StreamingConnectionState::Connected);
        session.disconnect();
    }

    #[tokio::test]
    async fn answers_legacy_and_json_pings() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (url, _) = spawn_relay(move |mut ws| {
            let tx = tx.clone();
            async move {
                accept_device(&mut ws).await;
                ws.send(Message::Text("ping".into())).await.unwrap();
                ws.send(Message::Text(json!({"type": "ping", "timestamp": 7}).to_string()))
                    .await
                    .unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        tx.send(text).unwrap();
                    }
                }
            }
        })
        .await;

        let (session, _) = session_with(options());
        session.connect(&url, "tok", "kiosk-9");

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, "pong");
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let second: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(second, json!({"type": "pong", "timestamp": 7}));
        session.disconnect();
    }

    #[tokio::test]
    async fn pong_answers_record_round_trip() {
        let (url, _) = spawn_relay(|mut ws| async move {
            accept_device(&mut ws).await;
            loop {
                let msg = next_json(&mut ws).await;
                if msg["type"] == "ping" {
                    let pong = json!({"type": "pong", "timestamp": msg["timestamp"]});
                    ws.send(Message::Text(pong.to_string())).await.unwrap();
                }
            }
        })
        .await;

        let opts = StreamingOptions {
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(400),
            ..options()
        };
        let (session, _) = session_with(opts);
        session.connect(&url, "tok", "kiosk-9");

        eventually(|| session.stats().last_rtt.is_some()).await;
        // answered pings keep the connection alive past the pong timeout
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(session.state(), StreamingConnectionState::Connected);
        session.disconnect();
    }

    #[tokio::test]
    async fn fractional_pong_timestamps_keep_the_link_alive() {
        let (url, accepted) = spawn_relay(|mut ws| async move {
            accept_device(&mut ws).await;
            loop {
                let msg = next_json(&mut ws).await;
                if msg["type"] == "ping" {
                    let ts = msg["timestamp"].as_i64().unwrap() as f64;
                    let pong = json!({"type": "pong", "timestamp": ts});
                    ws.send(Message::Text(pong.to_string())).await.unwrap();
                }
            }
        })
        .await;

        let opts = StreamingOptions {
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(400),
            ..options()
        };
        let (session, _) = session_with(opts);
        session.connect(&url, "tok", "kiosk-9");

        eventually(|| session.stats().last_rtt.is_some()).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(session.state(), StreamingConnectionState::Connected);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        session.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_that_waited_too_long_are_shed() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (url, _) = spawn_relay(move |mut ws| {
            let tx = tx.clone();
            async move {
                accept_device(&mut ws).await;
                ws.send(Message::Text(
                    json!({"type": "input_command", "command": {"kind": "tap"}}).to_string(),
                ))
                .await
                .unwrap();
                loop {
                    let msg = next_json(&mut ws).await;
                    if msg["type"] == "frame" {
                        tx.send(msg).unwrap();
                    }
                }
            }
        })
        .await;

        let opts = StreamingOptions {
            max_frame_age: Duration::from_millis(100),
            ..options()
        };
        let (session, recorder) = session_with(opts);
        recorder.inject_stall_ms.store(400, Ordering::SeqCst);
        session.connect(&url, "tok", "kiosk-9");
        wait_state(&session, StreamingConnectionState::Connected).await;

        // the session loop is stuck in the injector while these wait
        eventually(|| recorder.inputs.lock().unwrap().len() == 1).await;
        for i in 0..3 {
            assert!(session.queue_frame(vec![0xFF, 0xD8, i]));
        }
        eventually(|| session.stats().frames_dropped == 3).await;
        assert_eq!(session.stats().frames_sent, 0);

        assert!(session.queue_frame(vec![0xFF, 0xD8, 9]));
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame["format"], "jpeg");
        eventually(|| session.stats().frames_sent == 1).await;
        assert_eq!(session.stats().frames_dropped, 3);
        session.disconnect();
    }

    #[tokio::test]
    async fn missing_pongs_force_reconnect() {
        let (url, accepted) = spawn_relay(|mut ws| async move {
            accept_device(&mut ws).await;
            // swallow pings without answering
            while ws.next().await.is_some() {}
        })
        .await;

        let opts = StreamingOptions {
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_millis(200),
            ..options()
        };
        let (session, _) = session_with(opts);
        session.connect(&url, "tok", "kiosk-9");

        eventually(|| accepted.load(Ordering::SeqCst) >= 2).await;
        session.disconnect();
    }

    #[tokio::test]
    async fn reconnects_after_relay_closes() {
        let (url, accepted) = spawn_relay(|mut ws| async move {
            accept_device(&mut ws).await;
            let _ = ws.close(None).await;
        })
        .await;

        let (session, _) = session_with(options());
        session.connect(&url, "tok", "kiosk-9");
        eventually(|| accepted.load(Ordering::SeqCst) >= 3).await;

        session.disconnect();
        let after = accepted.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), after);
        assert_eq!(session.state(), StreamingConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_relay_keeps_retrying() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (session, _) = session_with(options());
        session.connect(&format!("ws://127.0.0.1:{}", port), "tok", "kiosk-9");

        let mut states = session.subscribe();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, StreamingConnectionState::Error(_))),
        )
        .await
        .expect("error state not reached")
        .unwrap()
        .clone();
        let StreamingConnectionState::Error(reason) = state else {
            unreachable!()
        };
        assert!(reason.starts_with("connect failed"), "{}", reason);
        assert!(!session.is_authenticated());

        // still retrying after the first failure
        tokio::time::timeout(Duration::from_secs(5), states.changed())
            .await
            .expect("no further attempt")
            .unwrap();
        session.disconnect();
        assert_eq!(session.state(), StreamingConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_connects() {
        let (session, _) = session_with(options());
        session.shutdown();
        assert!(!session.connect("ws://127.0.0.1:1", "tok", "kiosk-9"));
        assert!(!session.connect("", "tok", "kiosk-9"));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let opts = StreamingOptions::default();
        let mut delay = opts.initial_backoff;
        let mut seen = vec![delay.as_secs()];
        for _ in 0..6 {
            delay = opts.next_backoff(delay);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
