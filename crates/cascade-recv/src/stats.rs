//! Transfer progress observability.
//!
//! Progress counters are written by exactly one task each and sampled
//! by observers, so they live in word-sized atomic cells rather than
//! behind locks. Throughput comes from a small moving window over
//! `bytes_left` samples.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Samples kept in the throughput window.
const WINDOW: usize = 10;

/// Single-writer/multi-reader progress cells.
#[derive(Debug, Default)]
pub struct Progress {
    pub bytes_left: AtomicU64,
    pub bytes_per_second: AtomicU64,
    /// f32 bit pattern; see [`Progress::reception_rate`].
    reception_rate_bits: AtomicU32,
    pub last_segment: AtomicU64,
    pub wave: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl Progress {
    pub fn set_reception_rate(&self, rate: f32) {
        self.reception_rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn reception_rate(&self) -> f32 {
        f32::from_bits(self.reception_rate_bits.load(Ordering::Relaxed))
    }
}

/// Moving window turning `bytes_left` deltas into a rate.
pub struct ThroughputWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputWindow {
    pub fn new() -> Self {
        Self { samples: VecDeque::with_capacity(WINDOW + 1) }
    }

    /// Record a `bytes_left` observation and return the rate over the
    /// window, in bytes per second.
    pub fn push(&mut self, bytes_left: u64) -> u64 {
        self.push_at(Instant::now(), bytes_left)
    }

    fn push_at(&mut self, now: Instant, bytes_left: u64) -> u64 {
        self.samples.push_back((now, bytes_left));
        while self.samples.len() > WINDOW {
            self.samples.pop_front();
        }

        let (first_t, first_left) = *self.samples.front().expect("just pushed");
        let elapsed = now.duration_since(first_t).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0;
        }
        // bytes_left is monotone non-increasing; a reconnect can reset
        // it upward, in which case the window restarts.
        if bytes_left > first_left {
            self.samples.clear();
            self.samples.push_back((now, bytes_left));
            return 0;
        }
        ((first_left - bytes_left) as f64 / elapsed) as u64
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new()
    }
}
