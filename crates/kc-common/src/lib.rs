//! # kc-common
//!
//! Shared configuration and error types for KioskConnect.

pub mod config;
pub mod error;

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
