use serde::Deserialize;

/// Top-level agent configuration.
/// Loaded from environment variables (prefix `KC`, separator `__`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Control-plane (heartbeat API) settings
    #[serde(default)]
    pub control: ControlConfig,
    /// Reconnect backoff and circuit breaker settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Network stability settings
    #[serde(default)]
    pub network: NetworkConfig,
    /// Data-plane streaming settings
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Device credential, if already provisioned
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Base URL of the management API (default: http://localhost:8080)
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Per-request timeout in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// How often the process/power state is sampled (default: 10)
    #[serde(default = "default_power_poll")]
    pub power_poll_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Attempts before the circuit breaker opens (default: 10)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Consecutive heartbeat failures before the circuit breaker opens (default: 5)
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown")]
    pub circuit_breaker_cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Time the network must stay up before it counts as stable (default: 3000)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    /// Interface polling interval of the connectivity monitor (default: 5)
    #[serde(default = "default_network_poll")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Relay WebSocket URL. Streaming stays off when unset.
    #[serde(default)]
    pub url: Option<String>,
    /// Name reported in the authenticate message (default: hostname)
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_stream_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_stream_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_stream_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Consecutive drops after which the drop policy stops dropping (default: 5)
    #[serde(default = "default_max_consecutive_drops")]
    pub max_consecutive_drops: u32,
    /// Queued frames older than this are dropped instead of sent; 0 keeps them (default: 2000)
    #[serde(default = "default_max_frame_age")]
    pub max_frame_age_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl AgentConfig {
    /// Load config from `.env` (if present) and environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("KC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}

impl DeviceConfig {
    /// Both halves of the credential, if both are present and non-empty.
    pub fn credential(&self) -> Option<(&str, &str)> {
        match (self.device_id.as_deref(), self.token.as_deref()) {
            (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => Some((id, token)),
            _ => None,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            request_timeout_secs: default_request_timeout(),
            power_poll_secs: default_power_poll(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            backoff_base: default_backoff_base(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_breaker_cooldown(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            poll_interval_secs: default_network_poll(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            url: None,
            device_name: None,
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            auth_timeout_secs: default_auth_timeout(),
            initial_backoff_ms: default_stream_initial_backoff(),
            backoff_multiplier: default_stream_multiplier(),
            max_backoff_ms: default_stream_max_backoff(),
            queue_capacity: default_queue_capacity(),
            max_consecutive_drops: default_max_consecutive_drops(),
            max_frame_age_ms: default_max_frame_age(),
        }
    }
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_power_poll() -> u64 {
    10
}
fn default_initial_delay() -> u64 {
    2_000
}
fn default_backoff_base() -> f64 {
    2.0
}
fn default_max_delay() -> u64 {
    120_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown() -> u64 {
    300
}
fn default_debounce() -> u64 {
    3_000
}
fn default_network_poll() -> u64 {
    5
}
fn default_ping_interval() -> u64 {
    15
}
fn default_pong_timeout() -> u64 {
    45
}
fn default_auth_timeout() -> u64 {
    15
}
fn default_stream_initial_backoff() -> u64 {
    1_000
}
fn default_stream_multiplier() -> f64 {
    2.0
}
fn default_stream_max_backoff() -> u64 {
    30_000
}
fn default_queue_capacity() -> usize {
    5
}
fn default_max_consecutive_drops() -> u32 {
    5
}
fn default_max_frame_age() -> u64 {
    2_000
}
