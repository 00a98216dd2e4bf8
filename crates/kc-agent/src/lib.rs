//! # kc-agent
//!
//! Connectivity core of the KioskConnect device agent: control-plane
//! heartbeats with reconnect/backoff and a circuit breaker, network
//! stability debouncing, and the frame streaming session to the relay.

pub mod api;
pub mod collaborators;
pub mod connectivity;
pub mod debounce;
pub mod frame_queue;
pub mod lifecycle;
pub mod power;
pub mod reconnect;
pub mod state;
pub mod streaming;
pub mod sysinfo_collector;
