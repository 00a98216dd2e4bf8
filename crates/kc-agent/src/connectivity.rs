//! Polls interface state and feeds availability transitions to the
//! lifecycle manager.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::lifecycle::ConnectionLifecycleManager;
use crate::sysinfo_collector;

pub trait NetworkProbe: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Reports the network as available while a non-virtual IPv4 interface is up.
#[derive(Debug, Default)]
pub struct InterfaceProbe;

impl NetworkProbe for InterfaceProbe {
    fn is_available(&self) -> bool {
        sysinfo_collector::has_usable_interface()
    }
}

/// Receiver of raw (undebounced) availability signals.
pub trait NetworkEvents: Send + Sync {
    fn on_network_available(&self);
    fn on_network_lost(&self);
}

impl NetworkEvents for ConnectionLifecycleManager {
    fn on_network_available(&self) {
        ConnectionLifecycleManager::on_network_available(self);
    }

    fn on_network_lost(&self) {
        ConnectionLifecycleManager::on_network_lost(self);
    }
}

/// Probe every `every` and report transitions. The first probe is always reported.
pub fn spawn_monitor(
    probe: Arc<dyn NetworkProbe>,
    events: Arc<dyn NetworkEvents>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last: Option<bool> = None;

        loop {
            interval.tick().await;
            let available = probe.is_available();
            if last == Some(available) {
                continue;
            }
            last = Some(available);

            if available {
                tracing::info!("Network interface available");
                events.on_network_available();
            } else {
                tracing::warn!("No usable network interface");
                events.on_network_lost();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct Toggle(AtomicBool);

    impl NetworkProbe for Toggle {
        fn is_available(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl NetworkEvents for Recorder {
        fn on_network_available(&self) {
            self.0.lock().unwrap().push("available");
        }
        fn on_network_lost(&self) {
            self.0.lock().unwrap().push("lost");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_initial_state_then_transitions_only() {
        let probe = Arc::new(Toggle(AtomicBool::new(true)));
        let events = Arc::new(Recorder::default());
        let handle = spawn_monitor(probe.clone(), events.clone(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(*events.0.lock().unwrap(), vec!["available"]);

        probe.0.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        probe.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            *events.0.lock().unwrap(),
            vec!["available", "lost", "available"]
        );
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn offline_at_start_is_reported() {
        let probe = Arc::new(Toggle(AtomicBool::new(false)));
        let events = Arc::new(Recorder::default());
        let handle = spawn_monitor(probe, events.clone(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*events.0.lock().unwrap(), vec!["lost"]);
        handle.abort();
    }
}
