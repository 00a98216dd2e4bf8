//! # KioskConnect Agent
//!
//! Keeps a kiosk reachable: heartbeats the management API, reconnects with
//! backoff when the link drops, and streams the screen to the relay while
//! remote control is enabled for the device.
//!
//! ## Usage
//!
//! ```sh
//! kc-agent                                             # Run in foreground (default)
//! kc-agent run --server-url https://... --device-id ... --token ...
//! kc-agent register --server-url https://...           # Provision and print the credential
//! kc-agent unregister --device-id ... --token ...      # Remove this device
//! kc-agent version                                     # Print version info
//! ```
//!
//! All settings can also come from `KC_*` environment variables (see
//! `kc_common::config`).

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use kc_agent::api::ControlPlaneClient;
use kc_agent::collaborators::StaticDisplay;
use kc_agent::connectivity::{self, InterfaceProbe};
use kc_agent::lifecycle::{ConnectionLifecycleManager, LifecycleConfig};
use kc_agent::power::FixedPowerState;
use kc_agent::state::{ConnectionState, Credential, HeartbeatResult};
use kc_agent::streaming::{Collaborators, StreamingOptions, StreamingSession};
use kc_agent::sysinfo_collector::{self, SysinfoMetrics};
use kc_common::AgentConfig;
use kc_protocol::RegisterRequest;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (subcommand, flags) = match args.get(1).map(String::as_str) {
        Some(cmd) if !cmd.starts_with("--") => (cmd, &args[2..]),
        _ => ("run", args.get(1..).unwrap_or_default()),
    };

    if subcommand == "version" {
        println!(
            "KioskConnect Agent v{} ({} {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        );
        return Ok(());
    }

    let mut config = AgentConfig::load().context("Failed to load agent configuration")?;
    apply_flags(&mut config, flags)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    match subcommand {
        "register" => runtime.block_on(register(&config)),
        "unregister" => runtime.block_on(unregister(&config)),
        "run" => runtime.block_on(run(config)),
        other => anyhow::bail!(
            "Unknown command: {} (expected run, register, unregister or version)",
            other
        ),
    }
}

/// Apply `--server-url`, `--token`, `--device-id` on top of the loaded config.
fn apply_flags(config: &mut AgentConfig, args: &[String]) -> anyhow::Result<()> {
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        i += 1;
        let value = args
            .get(i)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} needs a value", flag))?;
        match flag {
            "--server-url" => config.control.server_url = value,
            "--token" => config.device.token = Some(value),
            "--device-id" => config.device.device_id = Some(value),
            other => anyhow::bail!("Unknown flag: {}", other),
        }
        i += 1;
    }
    Ok(())
}

fn control_client(config: &AgentConfig) -> anyhow::Result<ControlPlaneClient> {
    ControlPlaneClient::new(
        &config.control.server_url,
        Duration::from_secs(config.control.request_timeout_secs.max(1)),
    )
}

fn configured_credential(config: &AgentConfig) -> anyhow::Result<Credential> {
    config
        .device
        .credential()
        .and_then(|(device_id, token)| Credential::new(device_id, token))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No device credential: pass --device-id/--token, set KC_DEVICE__DEVICE_ID and \
                 KC_DEVICE__TOKEN, or run `kc-agent register` first"
            )
        })
}

async fn register(config: &AgentConfig) -> anyhow::Result<()> {
    let info = sysinfo_collector::collect_system_info();
    let request = RegisterRequest {
        device_name: config
            .streaming
            .device_name
            .clone()
            .unwrap_or_else(|| info.device_name.clone()),
        os_version: format!("{} {}", info.os, info.os_version),
        device_model: info.model.clone(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    tracing::info!("Registering {} with {}", request.device_name, config.control.server_url);
    let credential = control_client(config)?.register(&request).await?;

    println!("Device registered. Add to the agent environment:");
    println!("KC_DEVICE__DEVICE_ID={}", credential.device_id);
    println!("KC_DEVICE__TOKEN={}", credential.token);
    Ok(())
}

async fn unregister(config: &AgentConfig) -> anyhow::Result<()> {
    let credential = configured_credential(config)?;
    control_client(config)?.unregister(&credential).await?;
    println!("Device {} unregistered", credential.device_id);
    Ok(())
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    tracing::info!("KioskConnect Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let credential = configured_credential(&config)?;
    let info = sysinfo_collector::collect_system_info();
    tracing::info!(
        "Device: {} | OS: {} {} | Arch: {} | Model: {}",
        info.device_name,
        info.os,
        info.os_version,
        info.arch,
        info.model
    );

    let manager = ConnectionLifecycleManager::new(
        LifecycleConfig::from(&config),
        Arc::new(control_client(&config)?),
        Arc::new(SysinfoMetrics::new(Arc::new(StaticDisplay))),
        Arc::new(FixedPowerState::default()),
    );

    let monitor = connectivity::spawn_monitor(
        Arc::new(InterfaceProbe),
        Arc::new(manager.clone()),
        Duration::from_secs(config.network.poll_interval_secs.max(1)),
    );

    let streaming = StreamingSession::new(
        StreamingOptions::from_config(
            &config.streaming,
            info.device_name.clone(),
            format!("{} {}", info.os, info.os_version),
        ),
        Collaborators::default(),
    );

    let gate = match config.streaming.url.clone() {
        Some(url) => Some(tokio::spawn(gate_streaming(
            manager.heartbeat_results(),
            manager.subscribe(),
            streaming.clone(),
            url,
            credential.clone(),
        ))),
        None => {
            tracing::info!("KC_STREAMING__URL not set, screen streaming disabled");
            None
        }
    };

    manager.connect(&credential.device_id, &credential.token);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    if let Some(gate) = gate {
        gate.abort();
    }
    monitor.abort();
    streaming.shutdown();
    manager.shutdown();
    Ok(())
}

/// Keep the streaming session up while the control plane is connected and
/// the last heartbeat enabled remote control.
async fn gate_streaming(
    mut results: watch::Receiver<Option<HeartbeatResult>>,
    mut states: watch::Receiver<ConnectionState>,
    streaming: StreamingSession,
    url: String,
    credential: Credential,
) {
    let mut streaming_on = false;
    loop {
        let wanted = states.borrow_and_update().is_connected()
            && results
                .borrow_and_update()
                .as_ref()
                .is_some_and(|r| r.remote_control_enabled);

        if wanted != streaming_on {
            streaming_on = wanted;
            if wanted {
                tracing::info!("Remote control enabled, starting screen stream");
                streaming.connect(&url, &credential.token, &credential.device_id);
            } else {
                tracing::info!("Remote control unavailable, stopping screen stream");
                streaming.disconnect();
            }
        }

        tokio::select! {
            changed = results.changed() => if changed.is_err() { break },
            changed = states.changed() => if changed.is_err() { break },
        }
    }
}
