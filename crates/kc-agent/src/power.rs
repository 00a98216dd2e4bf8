//! Process and power-state awareness for heartbeat cadence.
//!
//! The state is polled, not event-driven, and only selects the heartbeat
//! interval/timeout pair. It never connects or disconnects anything.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerMode {
    Normal,
    LightDoze,
    DeepDoze,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessPowerState {
    pub process: ProcessState,
    pub power: PowerMode,
}

impl Default for ProcessPowerState {
    fn default() -> Self {
        Self {
            process: ProcessState::Foreground,
            power: PowerMode::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTiming {
    pub interval: Duration,
    /// Elapsed time since the last success that counts as a lost connection.
    pub timeout: Duration,
}

impl HeartbeatTiming {
    const fn secs(interval: u64, timeout: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        }
    }
}

impl ProcessPowerState {
    pub fn heartbeat_timing(&self) -> HeartbeatTiming {
        use PowerMode::*;
        use ProcessState::*;

        match (self.process, self.power) {
            (Foreground, Normal) => HeartbeatTiming::secs(30, 60),
            (Foreground, LightDoze) => HeartbeatTiming::secs(60, 120),
            (Background, Normal) => HeartbeatTiming::secs(90, 180),
            (Background, LightDoze) => HeartbeatTiming::secs(120, 240),
            (_, DeepDoze) => HeartbeatTiming::secs(300, 600),
        }
    }
}

/// Source of the current process/power state (OS integration lives outside the core).
pub trait PowerStateProvider: Send + Sync {
    fn current(&self) -> ProcessPowerState;
}

/// Provider that always reports the same state. Kiosks run foreground on mains power.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPowerState(pub ProcessPowerState);

impl PowerStateProvider for FixedPowerState {
    fn current(&self) -> ProcessPowerState {
        self.0
    }
}

/// Poll `provider` every `every`, publishing changes to `tx`.
pub fn spawn_poller(
    provider: Arc<dyn PowerStateProvider>,
    tx: watch::Sender<ProcessPowerState>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let next = provider.current();
            let changed = tx.send_if_modified(|current| {
                if *current == next {
                    return false;
                }
                *current = next;
                true
            });
            if changed {
                let timing = next.heartbeat_timing();
                tracing::info!(
                    "Power state changed to {:?}/{:?}, heartbeat every {}s (timeout {}s)",
                    next.process,
                    next.power,
                    timing.interval.as_secs(),
                    timing.timeout.as_secs()
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn matrix_anchor_values() {
        let fg = ProcessPowerState::default().heartbeat_timing();
        assert_eq!(fg, HeartbeatTiming::secs(30, 60));

        let bg = ProcessPowerState {
            process: ProcessState::Background,
            power: PowerMode::Normal,
        };
        assert_eq!(bg.heartbeat_timing(), HeartbeatTiming::secs(90, 180));

        for process in [ProcessState::Foreground, ProcessState::Background] {
            let deep = ProcessPowerState {
                process,
                power: PowerMode::DeepDoze,
            };
            assert_eq!(deep.heartbeat_timing(), HeartbeatTiming::secs(300, 600));
        }
    }

    #[test]
    fn timeout_is_always_twice_the_interval() {
        for process in [ProcessState::Foreground, ProcessState::Background] {
            for power in [PowerMode::Normal, PowerMode::LightDoze, PowerMode::DeepDoze] {
                let t = ProcessPowerState { process, power }.heartbeat_timing();
                assert_eq!(t.timeout, t.interval * 2);
            }
        }
    }

    struct Scripted(Mutex<ProcessPowerState>);

    impl PowerStateProvider for Scripted {
        fn current(&self) -> ProcessPowerState {
            *self.0.lock().unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poller_publishes_changes() {
        let provider = Arc::new(Scripted(Mutex::new(ProcessPowerState::default())));
        let (tx, mut rx) = watch::channel(ProcessPowerState::default());
        let handle = spawn_poller(provider.clone(), tx, Duration::from_secs(10));

        *provider.0.lock().unwrap() = ProcessPowerState {
            process: ProcessState::Background,
            power: PowerMode::LightDoze,
        };
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().power, PowerMode::LightDoze);

        handle.abort();
    }
}
