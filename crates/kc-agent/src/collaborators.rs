//! Interfaces to the parts of the kiosk that live outside the connectivity core.
//!
//! The display surface, the encoder/capture pipeline, input injection and the
//! adaptive-quality controller are provided by the host application. The core
//! only consumes the signals declared here.

use serde_json::Value;

/// Receives `input_command` payloads verbatim.
pub trait InputInjector: Send + Sync {
    fn inject(&self, command: &Value);
}

/// Capture and quality controls driven by `control_command` messages.
pub trait CaptureController: Send + Sync {
    fn stop_capture(&self);
    fn adjust_quality(&self, quality: u8);
    fn adjust_fps(&self, fps: u32);
    /// Current JPEG quality / encoder quality, if known.
    fn current_quality(&self) -> Option<u8> {
        None
    }
    fn current_fps(&self) -> Option<u32> {
        None
    }
}

/// Link health as judged by the latency estimator.
pub trait StreamHealth: Send + Sync {
    /// True while the link is unhealthy or critical and frames should be shed.
    fn should_drop(&self) -> bool;
    /// Feed a measured round-trip time.
    fn record_rtt(&self, _rtt: std::time::Duration) {}
}

/// Display surface state reported in heartbeats.
pub trait DisplayStatus: Send + Sync {
    fn screen_on(&self) -> bool;
    fn current_url(&self) -> Option<String>;
}

/// Input sink used when no injection backend is attached.
#[derive(Debug, Default)]
pub struct LoggingInputInjector;

impl InputInjector for LoggingInputInjector {
    fn inject(&self, command: &Value) {
        tracing::debug!("Input command (no injector attached): {}", command);
    }
}

/// Capture controller used when no capture pipeline is attached.
#[derive(Debug, Default)]
pub struct NoopCapture;

impl CaptureController for NoopCapture {
    fn stop_capture(&self) {
        tracing::debug!("stop_capture ignored: no capture pipeline attached");
    }
    fn adjust_quality(&self, quality: u8) {
        tracing::debug!(quality, "adjust_quality ignored: no capture pipeline attached");
    }
    fn adjust_fps(&self, fps: u32) {
        tracing::debug!(fps, "adjust_fps ignored: no capture pipeline attached");
    }
}

/// Health signal that never asks for drops.
#[derive(Debug, Default)]
pub struct AlwaysHealthy;

impl StreamHealth for AlwaysHealthy {
    fn should_drop(&self) -> bool {
        false
    }
}

/// Display that is always on and shows no URL.
#[derive(Debug, Default)]
pub struct StaticDisplay;

impl DisplayStatus for StaticDisplay {
    fn screen_on(&self) -> bool {
        true
    }
    fn current_url(&self) -> Option<String> {
        None
    }
}
