// src/status.rs
//
// Lock-free readback of engine state for callers outside the scheduler task.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Engine lifecycle.
///
/// Stopped -> Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EngineState {
    #[default]
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }
}

/// Snapshot of the engine as last published by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EngineStatus {
    pub state: EngineState,

    /// Chunks handed to the output in the current (or last) run.
    pub chunks_produced: u64,

    /// Start time of the next chunk to be produced.
    pub next_chunk_offset: f64,

    /// Seconds buffered ahead of the wall clock at the last decision.
    pub buffered_seconds: f64,

    /// Backpressure deferrals in the current (or last) run.
    pub deferrals: u64,

    /// Absolute peak of the last chunk, per channel.
    pub output_peaks: [f32; 2],

    /// Whether the last run ended on a fault.
    pub faulted: bool,
}

/// Atomics shared between the engine handle and its scheduler task.
///
/// f64 values are stored as bits in `AtomicU64` (no `AtomicF64` in std),
/// f32 peaks as bits in `AtomicU32`.
#[derive(Debug)]
pub(crate) struct SharedStatus {
    state: AtomicU8,
    chunks_produced: AtomicU64,
    next_offset_bits: AtomicU64,
    buffered_bits: AtomicU64,
    deferrals: AtomicU64,
    peak_bits: [AtomicU32; 2],
    faulted: AtomicBool,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Stopped as u8),
            chunks_produced: AtomicU64::new(0),
            next_offset_bits: AtomicU64::new(0.0_f64.to_bits()),
            buffered_bits: AtomicU64::new(0.0_f64.to_bits()),
            deferrals: AtomicU64::new(0),
            peak_bits: [AtomicU32::new(0), AtomicU32::new(0)],
            faulted: AtomicBool::new(false),
        }
    }
}

impl SharedStatus {
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to` only if the engine is still in `from`.
    pub fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear per-run counters at the start of a run.
    pub fn begin_run(&self) {
        self.chunks_produced.store(0, Ordering::Relaxed);
        self.deferrals.store(0, Ordering::Relaxed);
        self.next_offset_bits
            .store(0.0_f64.to_bits(), Ordering::Relaxed);
        self.buffered_bits.store(0.0_f64.to_bits(), Ordering::Relaxed);
        for peak in &self.peak_bits {
            peak.store(0, Ordering::Relaxed);
        }
        self.faulted.store(false, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, next_offset: f64, peaks: [f32; 2]) {
        self.chunks_produced.fetch_add(1, Ordering::Relaxed);
        self.next_offset_bits
            .store(next_offset.to_bits(), Ordering::Relaxed);
        for (slot, peak) in self.peak_bits.iter().zip(peaks) {
            slot.store(peak.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn record_buffered(&self, buffered: f64) {
        self.buffered_bits.store(buffered.to_bits(), Ordering::Relaxed);
    }

    pub fn record_deferral(&self) {
        self.deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_faulted(&self) {
        self.faulted.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            chunks_produced: self.chunks_produced.load(Ordering::Relaxed),
            next_chunk_offset: f64::from_bits(self.next_offset_bits.load(Ordering::Relaxed)),
            buffered_seconds: f64::from_bits(self.buffered_bits.load(Ordering::Relaxed)),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            output_peaks: [
                f32::from_bits(self.peak_bits[0].load(Ordering::Relaxed)),
                f32::from_bits(self.peak_bits[1].load(Ordering::Relaxed)),
            ],
            faulted: self.faulted.load(Ordering::Relaxed),
        }
    }
}
