//! Deferred work: timer tasks and the timing wheel.

pub mod timing_wheel;

use std::sync::atomic::{AtomicU64, Ordering};

pub use timing_wheel::TimingWheel;

/// A deferred callback tracked by the timing wheel.
///
/// The wheel holds only weak references: whoever wants the task to
/// fire keeps the `Arc` alive, and dropping it cancels the timer.
/// Periodic timers re-add their own task from inside the callback.
pub struct TimerTask {
    pub timer_id: u64,
    /// Delay until the (next) fire, in milliseconds.
    pub next_fire_duration_ms: u64,
    /// Work-wheel index this task cascades into when it is promoted
    /// from the assistant wheel.
    remainder_interval: AtomicU64,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl TimerTask {
    pub fn new<F>(timer_id: u64, next_fire_duration_ms: u64, callback: F) -> TimerTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        TimerTask {
            timer_id,
            next_fire_duration_ms,
            remainder_interval: AtomicU64::new(0),
            callback: Box::new(callback),
        }
    }

    pub(crate) fn set_remainder_interval(&self, index: u64) {
        self.remainder_interval.store(index, Ordering::Release);
    }

    pub(crate) fn remainder_interval(&self) -> u64 {
        self.remainder_interval.load(Ordering::Acquire)
    }

    pub(crate) fn run(&self) {
        (self.callback)();
    }
}
