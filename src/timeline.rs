// src/timeline.rs

use std::time::Duration;

use tokio::time::Instant;

/// Fraction of a chunk duration to wait before re-checking backpressure.
pub const RETRY_FACTOR: f64 = 0.9;

/// Outcome of one backpressure evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Produce the chunk starting at `offset` now.
    Dispatch { offset: f64 },

    /// Too far ahead of the wall clock; try again after `retry_after`.
    Defer { retry_after: Duration, buffered: f64 },
}

/// Wall-clock anchored position of the synthesis timeline.
///
/// Lives only in the scheduler task. `next_chunk_offset` never decreases
/// within a run; it is reset to zero on every start.
#[derive(Debug, Clone)]
pub struct Timeline {
    /// Wall-clock time of timeline zero.
    origin: Instant,

    /// Start time of the next chunk, in seconds.
    next_chunk_offset: f64,

    /// Duration of one chunk, in seconds.
    duration: f64,

    /// Backpressure bound, in chunks.
    max_buffered_chunks: u32,
}

impl Timeline {
    pub fn new(now: Instant, duration: f64, max_buffered_chunks: u32) -> Self {
        Self {
            origin: now,
            next_chunk_offset: 0.0,
            duration,
            max_buffered_chunks,
        }
    }

    /// Restart at offset zero anchored to `now`.
    pub fn reset(&mut self, now: Instant) {
        self.origin = now;
        self.next_chunk_offset = 0.0;
    }

    /// Change chunk sizing mid-run. The offset keeps counting from where
    /// it is, so already scheduled audio is untouched.
    pub fn reconfigure(&mut self, duration: f64, max_buffered_chunks: u32) {
        self.duration = duration;
        self.max_buffered_chunks = max_buffered_chunks;
    }

    #[inline]
    pub fn next_chunk_offset(&self) -> f64 {
        self.next_chunk_offset
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Seconds of audio produced ahead of the wall clock.
    ///
    /// `(origin + next_chunk_offset) - now`; negative when behind.
    pub fn buffered_seconds(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.origin).as_secs_f64();
        self.next_chunk_offset - elapsed
    }

    /// Decide whether the next chunk may be produced at `now`.
    ///
    /// Chunk zero always dispatches.
    pub fn evaluate(&self, now: Instant) -> Decision {
        let buffered = self.buffered_seconds(now);
        let ahead = buffered / self.duration;

        if self.next_chunk_offset > 0.0 && ahead > self.max_buffered_chunks as f64 {
            Decision::Defer {
                retry_after: Duration::from_secs_f64(self.duration * RETRY_FACTOR),
                buffered,
            }
        } else {
            Decision::Dispatch {
                offset: self.next_chunk_offset,
            }
        }
    }

    /// Move past a produced chunk of `duration` seconds.
    pub fn advance(&mut self, duration: f64) {
        self.next_chunk_offset += duration;
    }
}
