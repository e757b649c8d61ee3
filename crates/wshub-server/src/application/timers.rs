//! Interval timers run by the event loop.
//!
//! Timers fire on the loop thread between socket polls, so a callback may
//! freely use the application registry and queue outbound messages.  A timer
//! is due once `now - last_fired >= interval`; after firing, `last_fired`
//! becomes `now` (not the ideal schedule time), so a slow loop delays later
//! firings instead of bunching them up.  Every timer starts with
//! `last_fired = 0` and therefore fires on the first loop iteration.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::application::registry::{guarded, ApplicationRegistry, Outbox};

/// Callback invoked when a timer is due.
pub type TimerCallback = Box<dyn FnMut(&mut ApplicationRegistry, &mut Outbox) + Send>;

struct Timer {
    interval_ms: u64,
    last_fired_ms: u64,
    callback: TimerCallback,
}

/// Insertion-ordered collection of interval timers.
#[derive(Default)]
pub struct TimerScheduler {
    timers: Vec<Timer>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a timer that fires every `interval`.
    pub fn add<F>(&mut self, interval: Duration, callback: F)
    where
        F: FnMut(&mut ApplicationRegistry, &mut Outbox) + Send + 'static,
    {
        self.timers.push(Timer {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            last_fired_ms: 0,
            callback: Box::new(callback),
        });
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Fires every due timer against the wall clock.
    pub fn run(&mut self, applications: &mut ApplicationRegistry, outbox: &mut Outbox) -> usize {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        self.run_due(now_ms, applications, outbox)
    }

    /// Fires every timer due at `now_ms`, in insertion order, and returns
    /// how many fired.  A panicking callback is logged and does not stop the
    /// remaining timers.
    pub fn run_due(
        &mut self,
        now_ms: u64,
        applications: &mut ApplicationRegistry,
        outbox: &mut Outbox,
    ) -> usize {
        let mut fired = 0;
        for (index, timer) in self.timers.iter_mut().enumerate() {
            if now_ms.saturating_sub(timer.last_fired_ms) < timer.interval_ms {
                continue;
            }
            let callback = &mut timer.callback;
            if let Err(e) = guarded(|| {
                callback(applications, outbox);
                Ok(())
            }) {
                warn!(timer = index, "timer callback failed: {e}");
            }
            timer.last_fired_ms = now_ms;
            fired += 1;
        }
        fired
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
