use std::sync::atomic::{AtomicI64, Ordering};

use tokio::time::Instant;

/// The node's view of session time: a local monotonic clock plus an offset that aligns it with
///  the reference node's clock.
///
/// The offset is written by clock sync only and read everywhere else, so it is a single atomic
///  word rather than lock protected state.
pub struct Clock {
    reference_time: Instant,
    offset_us: AtomicI64,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            reference_time: Instant::now(),
            offset_us: AtomicI64::new(0),
        }
    }

    /// microseconds on the local monotonic clock, unaffected by clock sync
    pub fn local_us(&self) -> i64 {
        Instant::now()
            .saturating_duration_since(self.reference_time)
            .as_micros()
            .try_into()
            .unwrap_or(i64::MAX)
    }

    pub fn offset_us(&self) -> i64 {
        self.offset_us.load(Ordering::Acquire)
    }

    pub fn set_offset_us(&self, offset_us: i64) {
        self.offset_us.store(offset_us, Ordering::Release);
    }

    /// microseconds on the session's reference clock
    pub fn time_us(&self) -> i64 {
        self.local_us().saturating_add(self.offset_us())
    }

    /// [Clock::time_us] as it is sent on the wire
    pub fn timestamp_us(&self) -> u64 {
        self.time_us().max(0) as u64
    }

    pub fn time_secs(&self) -> f64 {
        self.time_us() as f64 / 1e6
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
