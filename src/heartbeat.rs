//! ==============================================================================
//! heartbeat.rs - liveness watchdog
//! ==============================================================================
//!
//! purpose:
//!     answers "has anything arrived recently?".
//!     every observed event calls `beat()`, which restarts the window. if the
//!     window runs out with no beat the derived flag flips to disconnected.
//!
//!     the relay keeps one of these for plant telemetry; the flag is served on
//!     GET /api so dashboards no longer need their own per-page timers.
//!
//! lifecycle:
//!     starts disconnected. the timer task is aborted when the Heartbeat drops.
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

pub struct Heartbeat {
    notify: Arc<Notify>,
    state: watch::Receiver<bool>,
    // unix ms of the last beat, 0 = never
    last_beat_ms: AtomicU64,
    window: Duration,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// must be called from inside a tokio runtime
    pub fn spawn(window: Duration) -> Self {
        let notify = Arc::new(Notify::new());
        let (tx, state) = watch::channel(false);
        let task = tokio::spawn(watch_beats(notify.clone(), tx, window));
        Self { notify, state, last_beat_ms: AtomicU64::new(0), window, task }
    }

    pub fn beat(&self) {
        self.last_beat_ms.store(now_ms(), Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// follow connected/disconnected transitions
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }

    pub fn last_beat_ms(&self) -> Option<u64> {
        match self.last_beat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_beats(notify: Arc<Notify>, tx: watch::Sender<bool>, window: Duration) {
    loop {
        let connected = *tx.borrow();
        tokio::select! {
            _ = notify.notified() => {
                tx.send_if_modified(|state| !std::mem::replace(state, true));
            }
            // a fresh sleep each turn, so every beat restarts the window
            _ = tokio::time::sleep(window), if connected => {
                tx.send_replace(false);
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
