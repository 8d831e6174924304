//! Inactivity watchdog
//!
//! Cancels a session after a configurable period of silence. The fire
//! path runs exactly once; an activity update that races with expiry
//! either refreshes the deadline or is dropped, never resurrecting a
//! fired timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct TimerState {
    last_activity: Mutex<Instant>,
    timeout: Mutex<Duration>,
    fired: AtomicBool,
    reconfigured: Notify,
}

/// Handle to a running inactivity timer. Cloneable; all clones drive
/// the same deadline.
#[derive(Clone)]
pub struct ActivityTimer {
    state: Arc<TimerState>,
}

impl ActivityTimer {
    /// Record activity, pushing the deadline out by the current
    /// timeout.
    pub fn update(&self) {
        *self.state.last_activity.lock() = Instant::now();
    }

    /// Replace the idle duration. Takes effect immediately, also for a
    /// deadline already scheduled.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.state.timeout.lock() = timeout;
        self.update();
        self.state.reconfigured.notify_waiters();
    }

    /// Whether the watchdog has fired.
    pub fn fired(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }
}

/// Arm a watchdog that runs `on_timeout` once after `idle` of silence
/// and exits when `token` is cancelled.
///
/// The conventional `on_timeout` cancels the same session token, which
/// also stops the monitor.
pub fn cancel_after_inactivity<F>(token: CancellationToken, on_timeout: F, idle: Duration) -> ActivityTimer
where
    F: FnOnce() + Send + 'static,
{
    let state = Arc::new(TimerState {
        last_activity: Mutex::new(Instant::now()),
        timeout: Mutex::new(idle),
        fired: AtomicBool::new(false),
        reconfigured: Notify::new(),
    });

    let monitor_state = state.clone();
    tokio::spawn(async move {
        let mut on_timeout = Some(on_timeout);
        loop {
            let deadline = *monitor_state.last_activity.lock() + *monitor_state.timeout.lock();
            let now = Instant::now();
            if now >= deadline {
                // The decision point: once `fired` flips, later
                // updates are dropped rather than resurrecting us.
                if !monitor_state.fired.swap(true, Ordering::SeqCst) {
                    if let Some(f) = on_timeout.take() {
                        f();
                    }
                }
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(deadline - now) => {}
                _ = monitor_state.reconfigured.notified() => {}
                _ = token.cancelled() => return,
            }
        }
    });

    ActivityTimer { state }
}
