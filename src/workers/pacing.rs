//! Frame rate decimation and measurement

/// Drops frames arriving faster than the target rate
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval_us: u64,
    next_due_us: Option<u64>,
}

impl FramePacer {
    pub fn new(fps: u32) -> Self {
        Self {
            interval_us: 1_000_000 / fps.max(1) as u64,
            next_due_us: None,
        }
    }

    /// Whether a frame captured at `timestamp_us` should be kept
    pub fn admit(&mut self, timestamp_us: u64) -> bool {
        // Tolerate a quarter interval of jitter so a source running at
        // exactly the target rate is not decimated
        let slack = self.interval_us / 4;
        match self.next_due_us {
            Some(due) if timestamp_us + slack < due => false,
            Some(due) => {
                // Stay on the grid, but never schedule behind a stalled source
                let next = due + self.interval_us;
                self.next_due_us = Some(if next + slack < timestamp_us {
                    timestamp_us + self.interval_us
                } else {
                    next
                });
                true
            }
            None => {
                self.next_due_us = Some(timestamp_us + self.interval_us);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.next_due_us = None;
    }
}

/// Counts frames over a reporting window
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window_us: u64,
    started_us: Option<u64>,
    frames: u32,
}

impl FpsMeter {
    pub fn new(window_us: u64) -> Self {
        Self {
            window_us,
            started_us: None,
            frames: 0,
        }
    }

    /// Count a frame. Returns the measured rate when a window closes.
    pub fn tick(&mut self, now_us: u64) -> Option<f64> {
        let started = *self.started_us.get_or_insert(now_us);
        self.frames += 1;
        let elapsed = now_us.saturating_sub(started);
        if elapsed < self.window_us {
            return None;
        }
        let fps = self.frames as f64 * 1_000_000.0 / elapsed as f64;
        self.started_us = Some(now_us);
        self.frames = 0;
        Some(fps)
    }

    pub fn reset(&mut self) {
        self.started_us = None;
        self.frames = 0;
    }
}
