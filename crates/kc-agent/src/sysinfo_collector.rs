//! Device information and health metrics for registration and heartbeats.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use sysinfo::{Components, Disks, Networks, System};
use tokio::sync::Mutex;

use kc_protocol::HeartbeatRequest;

use crate::collaborators::DisplayStatus;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub device_name: String,
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub model: String,
}

/// Collect static device information.
pub fn collect_system_info() -> SystemInfo {
    SystemInfo {
        device_name: System::host_name().unwrap_or_else(|| "unknown".into()),
        os: std::env::consts::OS.to_string(),
        os_version: System::os_version().unwrap_or_else(|| "unknown".into()),
        arch: std::env::consts::ARCH.to_string(),
        model: read_device_model().unwrap_or_else(|| std::env::consts::ARCH.to_string()),
    }
}

/// Produces the metrics carried by each heartbeat.
#[async_trait]
pub trait DeviceMetricsSource: Send + Sync {
    async fn collect(&self) -> HeartbeatRequest;
}

/// Metrics sampled from the host via `sysinfo`.
pub struct SysinfoMetrics {
    sys: Mutex<System>,
    display: Arc<dyn DisplayStatus>,
}

impl SysinfoMetrics {
    pub fn new(display: Arc<dyn DisplayStatus>) -> Self {
        Self {
            sys: Mutex::new(System::new()),
            display,
        }
    }
}

#[async_trait]
impl DeviceMetricsSource for SysinfoMetrics {
    async fn collect(&self) -> HeartbeatRequest {
        let (ram_used, ram_total) = {
            let mut sys = self.sys.lock().await;
            sys.refresh_memory();
            (sys.used_memory(), sys.total_memory())
        };

        let disks = Disks::new_with_refreshed_list();
        let (mut available, mut total) = (0u64, 0u64);
        for disk in disks.list() {
            available += disk.available_space();
            total += disk.total_space();
        }

        let network_type = primary_interface().map(|name| classify_interface(&name).to_string());

        HeartbeatRequest {
            battery_level: None,
            wifi_strength: read_wifi_signal(),
            screen_on: Some(self.display.screen_on()),
            storage_available_mb: (total > 0).then_some(available / MB),
            storage_total_mb: (total > 0).then_some(total / MB),
            ram_usage_mb: Some(ram_used / MB),
            ram_total_mb: Some(ram_total / MB),
            cpu_temp: read_cpu_temp(),
            network_type,
            current_url: self.display.current_url(),
            ..HeartbeatRequest::online()
        }
    }
}

/// Whether any usable (non-loopback, non-virtual) IPv4 interface is up.
pub fn has_usable_interface() -> bool {
    primary_interface().is_some()
}

/// Name of the first non-loopback interface with an IPv4 address.
fn primary_interface() -> Option<String> {
    let networks = Networks::new_with_refreshed_list();
    for (name, data) in networks.iter() {
        if is_virtual_interface(name) {
            continue;
        }
        if data
            .ip_networks()
            .iter()
            .any(|ip| ip.addr.is_ipv4() && !ip.addr.is_loopback())
        {
            return Some(name.clone());
        }
    }
    None
}

fn is_virtual_interface(name: &str) -> bool {
    name == "lo"
        || name.starts_with("docker")
        || name.starts_with("veth")
        || name.starts_with("br-")
}

fn classify_interface(name: &str) -> &'static str {
    if name.starts_with("wl") || name.starts_with("wifi") {
        "wifi"
    } else if name.starts_with("wwan") || name.starts_with("rmnet") || name.starts_with("ccmni") {
        "cellular"
    } else if name.starts_with("eth") || name.starts_with("en") {
        "ethernet"
    } else {
        "other"
    }
}

fn read_cpu_temp() -> Option<f32> {
    let components = Components::new_with_refreshed_list();
    components
        .iter()
        .find(|c| {
            let label = c.label().to_lowercase();
            label.contains("cpu") || label.contains("package") || label.contains("tctl")
        })
        .map(|c| c.temperature())
        .filter(|t| t.is_finite() && *t > 0.0)
}

/// Signal level in dBm of the first wireless interface.
#[cfg(target_os = "linux")]
fn read_wifi_signal() -> Option<i32> {
    let content = std::fs::read_to_string("/proc/net/wireless").ok()?;
    parse_wireless_level(&content)
}

#[cfg(not(target_os = "linux"))]
fn read_wifi_signal() -> Option<i32> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_wireless_level(content: &str) -> Option<i32> {
    // Two header lines, then: "wlan0: 0000   54.  -56.  -256 ..."
    content.lines().skip(2).find_map(|line| {
        let mut fields = line.split_whitespace();
        fields.next()?; // interface
        fields.next()?; // status
        fields.next()?; // link quality
        let level = fields.next()?.trim_end_matches('.');
        level.parse::<f32>().ok().map(|l| l as i32)
    })
}

#[cfg(target_os = "linux")]
fn read_device_model() -> Option<String> {
    ["/sys/firmware/devicetree/base/model", "/sys/class/dmi/id/product_name"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
        .find(|s| !s.is_empty())
}

#[cfg(not(target_os = "linux"))]
fn read_device_model() -> Option<String> {
    None
}
