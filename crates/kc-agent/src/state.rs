//! Observable connection states and the device credential.

use std::fmt;
use tokio::time::Instant;

/// Device identity presented to both the control plane and the relay.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub device_id: String,
    pub token: String,
}

impl Credential {
    /// Returns `None` unless both halves are non-empty.
    pub fn new(device_id: impl Into<String>, token: impl Into<String>) -> Option<Self> {
        let device_id = device_id.into();
        let token = token.into();
        if device_id.trim().is_empty() || token.trim().is_empty() {
            return None;
        }
        Some(Self { device_id, token })
    }
}

// Never print the token.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("device_id", &self.device_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// How long a server-imposed block lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedUntil {
    /// Until the next explicit `connect`.
    Indefinite,
    At(Instant),
}

impl BlockedUntil {
    pub fn is_expired(&self, now: Instant) -> bool {
        match self {
            Self::Indefinite => false,
            Self::At(deadline) => now >= *deadline,
        }
    }
}

/// Control-plane connection state. Only the lifecycle manager writes it.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { since: Instant },
    Reconnecting { attempt: u32, next_attempt_at: Instant },
    ServerBlocked { until: BlockedUntil },
    CircuitOpen { since: Instant },
    Error { message: String, retryable: bool },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Connecting, reconnecting or connected: a loop already owns the link.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected { .. } | Self::Reconnecting { .. }
        )
    }

    /// A server block that still applies at `now`.
    pub fn is_blocked_at(&self, now: Instant) -> bool {
        match self {
            Self::ServerBlocked { until } => !until.is_expired(now),
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected { .. } => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ServerBlocked { .. } => "server_blocked",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Error { .. } => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt, .. } => write!(f, "reconnecting (attempt {})", attempt),
            Self::Error { message, retryable } => {
                write!(f, "error: {} (retryable: {})", message, retryable)
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Data-plane (relay) connection state, independent of [`ConnectionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error(String),
}

/// Server policy carried by a successful heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResult {
    pub remote_control_enabled: bool,
    pub should_reconnect: bool,
}

impl From<kc_protocol::HeartbeatData> for HeartbeatResult {
    fn from(data: kc_protocol::HeartbeatData) -> Self {
        Self {
            remote_control_enabled: data.remote_control_enabled,
            should_reconnect: data.should_reconnect,
        }
    }
}
