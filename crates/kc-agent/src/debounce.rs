//! Network stability debouncing.
//!
//! Raw connectivity transitions flap while Wi-Fi associates or the OS wakes
//! from doze. The debouncer only reports the network as stable after an
//! availability event has held for the debounce window; a loss event is
//! reported immediately and cancels any pending window.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct NetworkStabilityDebouncer {
    window: Duration,
    stable_tx: watch::Sender<bool>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkStabilityDebouncer {
    pub fn new(window: Duration) -> Self {
        let (stable_tx, _) = watch::channel(false);
        Self {
            window,
            stable_tx,
            pending: Mutex::new(None),
        }
    }

    pub fn is_stable(&self) -> bool {
        *self.stable_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stable_tx.subscribe()
    }

    /// Start (or keep) the debounce window. Must be called inside a tokio runtime.
    pub fn signal_available(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_stable() {
            return;
        }
        if pending.as_ref().is_some_and(|h| !h.is_finished()) {
            // A window is already running; a repeated availability event doesn't restart it.
            return;
        }

        let tx = self.stable_tx.clone();
        let window = self.window;
        tracing::debug!("Network available, waiting {:?} for stability", window);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            tx.send_if_modified(|stable| !std::mem::replace(stable, true));
            tracing::info!("Network stable");
        }));
    }

    /// Cancel any pending window and report the network as unstable.
    pub fn signal_lost(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        if self.stable_tx.send_if_modified(|stable| std::mem::replace(stable, false)) {
            tracing::info!("Network lost");
        }
    }

    /// Stop the pending window without changing the reported value.
    pub fn cancel(&self) {
        if let Some(handle) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for NetworkStabilityDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
