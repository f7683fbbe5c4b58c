//! Monotonic time source shared by every worker
//!
//! All frame and audio timestamps come from one `Clock` so that trigger times
//! and frame times can be compared directly. Tests swap in `ManualClock`.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cooperative stop flag that sleeping workers can wait on
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every waiter to stop
    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Block for up to `timeout`. Returns true if stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return true;
        }
        let _ = self.cond.wait_for(&mut stopped, timeout);
        *stopped
    }
}

/// Source of monotonic timestamps in microseconds
pub trait Clock: Send + Sync {
    /// Microseconds since the clock's origin
    fn now_us(&self) -> u64;

    /// Sleep for `duration` unless `stop` fires first. Returns true if stopped.
    fn sleep(&self, duration: Duration, stop: &StopSignal) -> bool;
}

/// Real clock backed by `Instant`
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn sleep(&self, duration: Duration, stop: &StopSignal) -> bool {
        stop.wait_timeout(duration)
    }
}

/// Simulated clock: time only moves when advanced or slept on
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(now_us),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set_us(&self, now_us: u64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration, stop: &StopSignal) -> bool {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        // Yield so a spinning worker cannot starve the test thread
        std::thread::yield_now();
        stop.is_stopped()
    }
}
