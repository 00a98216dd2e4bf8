//! # kc-protocol
//!
//! Wire types shared by the KioskConnect agent: JSON text frames spoken
//! on the streaming relay, and the control-plane HTTP request/response
//! bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role announced in the authenticate message.
pub const DEVICE_ROLE: &str = "device";

/// Legacy non-JSON liveness frames still sent by older relays.
pub const LEGACY_PING: &str = "ping";
pub const LEGACY_PONG: &str = "pong";

/// Default capacity of the outbound frame queue.
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 5;

/// Control-plane endpoints, relative to the server base URL.
pub const HEARTBEAT_PATH: &str = "/api/devices/heartbeat";
pub const REGISTER_PATH: &str = "/api/devices/register";
pub const UNREGISTER_PATH: &str = "/api/devices/unregister";

// ── Data plane ──────────────────────────────────────────────

/// Encoded frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    Jpeg,
    H264,
}

/// Messages the device sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        role: String,
        #[serde(rename = "deviceId")]
        device_id: String,
        token: String,
        #[serde(rename = "deviceName")]
        device_name: String,
        #[serde(rename = "osVersion")]
        os_version: String,
    },
    Ping {
        timestamp: i64,
    },
    /// Reply to a relay-initiated JSON ping.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Frame {
        format: FrameFormat,
        /// Base64-encoded frame bytes
        data: String,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_keyframe: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        quality: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fps: Option<u32>,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages the relay sends to the device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated,
    AuthSuccess,
    AuthFailed {
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Ping {
        #[serde(default, deserialize_with = "lenient_timestamp")]
        timestamp: Option<i64>,
    },
    Pong {
        #[serde(default, deserialize_with = "lenient_timestamp")]
        timestamp: Option<i64>,
    },
    InputCommand {
        #[serde(default)]
        command: Value,
    },
    ControlCommand(ControlCommand),
    #[serde(other)]
    Unknown,
}

/// Relay timestamps arrive as integers, floats or numeric strings depending
/// on the relay build. Anything unreadable becomes `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let number = |n: &serde_json::Number| n.as_i64().or_else(|| n.as_f64().map(|f| f as i64));
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => number(&n),
        Some(Value::String(s)) => s
            .trim()
            .parse::<serde_json::Number>()
            .ok()
            .and_then(|n| number(&n)),
        _ => None,
    })
}

/// Body of a `control_command` message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlCommand {
    pub action: String,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// A decoded control action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    StopCapture,
    AdjustQuality(u8),
    AdjustFps(u32),
    /// Known action with a missing or malformed parameter, or an unknown action.
    Unsupported(String),
}

impl ControlCommand {
    /// Resolve the action, reading parameters either inline or from `params`.
    pub fn action(&self) -> ControlAction {
        let param = |key: &str| {
            self.params
                .as_ref()
                .and_then(|p| p.get(key))
                .and_then(Value::as_u64)
        };

        match self.action.as_str() {
            "stop_capture" => ControlAction::StopCapture,
            "adjust_quality" => self
                .quality
                .or_else(|| param("quality").and_then(|q| u8::try_from(q).ok()))
                .map(ControlAction::AdjustQuality)
                .unwrap_or_else(|| ControlAction::Unsupported(self.action.clone())),
            "adjust_fps" => self
                .fps
                .or_else(|| param("fps").and_then(|f| u32::try_from(f).ok()))
                .map(ControlAction::AdjustFps)
                .unwrap_or_else(|| ControlAction::Unsupported(self.action.clone())),
            other => ControlAction::Unsupported(other.to_string()),
        }
    }
}

/// A text frame received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    LegacyPing,
    LegacyPong,
}

/// Decode a text frame, accepting the legacy plain-text liveness frames.
pub fn decode_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    match text.trim() {
        LEGACY_PING => Ok(Inbound::LegacyPing),
        LEGACY_PONG => Ok(Inbound::LegacyPong),
        json => serde_json::from_str(json).map(Inbound::Message),
    }
}

// ── Control plane ───────────────────────────────────────────

/// `POST /api/devices/heartbeat` body. Everything but `status` is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeartbeatRequest {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_strength: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_available_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_total_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_usage_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_total_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temp: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
}

impl HeartbeatRequest {
    pub fn online() -> Self {
        Self {
            status: "online",
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<HeartbeatData>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HeartbeatData {
    #[serde(default)]
    pub remote_control_enabled: bool,
    #[serde(default = "default_should_reconnect")]
    pub should_reconnect: bool,
}

fn default_should_reconnect() -> bool {
    true
}

/// `POST /api/devices/register` body.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub device_name: String,
    pub os_version: String,
    pub device_model: String,
    pub app_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<RegisterData>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterData {
    pub device_id: String,
    pub token: String,
}
