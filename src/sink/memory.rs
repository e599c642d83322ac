// src/sink/memory.rs
//
// Output that records what it is asked to play.

use std::sync::Arc;

use parking_lot::Mutex;

use super::AudioOutput;
use crate::audio_buffer::PlanarBuffer;
use crate::error::SinkError;

/// One buffer as scheduled on a [`MemoryOutput`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    /// Zero-based run the buffer was scheduled in.
    pub run: usize,
    pub start_time: f64,
    pub buffer: PlanarBuffer,
}

#[derive(Debug, Default)]
struct MemoryLog {
    buffers: Vec<ScheduledBuffer>,
    runs: usize,
    released: usize,
    closed: bool,
}

/// Read access to a [`MemoryOutput`] after it moved into the engine.
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryHandle {
    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.log.lock().buffers.clone()
    }

    pub fn start_times(&self) -> Vec<f64> {
        self.log.lock().buffers.iter().map(|b| b.start_time).collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of runs started.
    pub fn runs(&self) -> usize {
        self.log.lock().runs
    }

    pub fn released(&self) -> usize {
        self.log.lock().released
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }
}

/// In-memory output; every buffer "finishes" as soon as it is scheduled.
pub struct MemoryOutput {
    channels: usize,
    unreleased: usize,
    queue_capacity: Option<usize>,
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryOutput {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            unreleased: 0,
            queue_capacity: None,
            log: Arc::new(Mutex::new(MemoryLog::default())),
        }
    }

    /// Report a fixed queue size, like a device output.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            log: Arc::clone(&self.log),
        }
    }
}

impl AudioOutput for MemoryOutput {
    fn channels(&self) -> usize {
        self.channels
    }

    fn queue_capacity(&self) -> Option<usize> {
        self.queue_capacity
    }

    fn begin_run(&mut self) -> Result<(), SinkError> {
        let mut log = self.log.lock();
        if log.closed {
            return Err(SinkError::Closed);
        }
        log.runs += 1;
        Ok(())
    }

    fn schedule(&mut self, start_time: f64, buffer: PlanarBuffer) -> Result<(), SinkError> {
        let mut log = self.log.lock();
        if log.closed {
            return Err(SinkError::Closed);
        }
        let run = log.runs.saturating_sub(1);
        log.buffers.push(ScheduledBuffer {
            run,
            start_time,
            buffer,
        });
        self.unreleased += 1;
        Ok(())
    }

    fn reclaim(&mut self) -> usize {
        let released = std::mem::take(&mut self.unreleased);
        self.log.lock().released += released;
        released
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.reclaim();
        self.log.lock().closed = true;
        Ok(())
    }
}
