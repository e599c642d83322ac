//! Playback side of the engine.
//!
//! The scheduler hands every finished [`SampleChunk`] to a
//! [`PlaybackSinkAdapter`], which de-interleaves it and schedules it on an
//! [`AudioOutput`] at the chunk's timeline offset.
//!
//! Outputs keep their own clock. Each engine run starts a new segment on
//! that clock (see [`AudioOutput::begin_run`]); chunk start times are
//! relative to the segment start.

mod memory;
mod wav;

#[cfg(feature = "playback")]
mod hardware;

pub use memory::{MemoryHandle, MemoryOutput, ScheduledBuffer};
pub use wav::WavOutput;

#[cfg(feature = "playback")]
pub use hardware::HardwareOutput;

use log::trace;

use crate::audio_buffer::PlanarBuffer;
use crate::chunk::SampleChunk;
use crate::error::SinkError;

/// A device (or file) that plays planar buffers at timeline offsets.
pub trait AudioOutput: Send + 'static {
    /// Channel count the output expects.
    fn channels(&self) -> usize;

    /// Most buffers the output can hold queued or playing at once, or
    /// `None` when it has no fixed limit.
    fn queue_capacity(&self) -> Option<usize> {
        None
    }

    /// Start a new run. Offsets passed to [`schedule`](Self::schedule) are
    /// relative to this point on the output's clock.
    fn begin_run(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Queue `buffer` to start playing `start_time` seconds into the run.
    fn schedule(&mut self, start_time: f64, buffer: PlanarBuffer) -> Result<(), SinkError>;

    /// Release resources of buffers that finished playing.
    ///
    /// Returns how many were released. Never blocks.
    fn reclaim(&mut self) -> usize;

    /// Flush and release the output. Further scheduling fails with
    /// [`SinkError::Closed`].
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Converts chunks into scheduled planar buffers.
pub struct PlaybackSinkAdapter<O: AudioOutput> {
    output: O,
    released: u64,
}

impl<O: AudioOutput> PlaybackSinkAdapter<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            released: 0,
        }
    }

    pub fn begin_run(&mut self) -> Result<(), SinkError> {
        self.output.begin_run()
    }

    /// Schedule a chunk and report its duration.
    pub fn submit(&mut self, chunk: SampleChunk) -> Result<f64, SinkError> {
        let expected = self.output.channels();
        if chunk.channels != expected {
            return Err(SinkError::ChannelMismatch {
                expected,
                got: chunk.channels,
            });
        }

        let planar = chunk.deinterleave();
        self.output.schedule(chunk.start_time, planar)?;
        self.reclaim();

        Ok(chunk.duration)
    }

    /// Release buffers the output has finished with.
    pub fn reclaim(&mut self) -> usize {
        let released = self.output.reclaim();
        if released > 0 {
            self.released += released as u64;
            trace!("Released {} finished buffer(s)", released);
        }
        released
    }

    /// Total buffers released so far.
    #[inline]
    pub fn released(&self) -> u64 {
        self.released
    }

    pub fn close(&mut self) -> Result<(), SinkError> {
        self.output.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_deinterleaves_and_reports_duration() {
        let output = MemoryOutput::new(2);
        let handle = output.handle();
        let mut adapter = PlaybackSinkAdapter::new(output);

        let chunk = SampleChunk::new(0.5, 0.25, 2, vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        let duration = adapter.submit(chunk).unwrap();
        assert_eq!(duration, 0.25);

        let scheduled = handle.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].start_time, 0.5);
        assert_eq!(scheduled[0].buffer.channel(0), &[1.0, 2.0, 3.0]);
        assert_eq!(scheduled[0].buffer.channel(1), &[-1.0, -2.0, -3.0]);
    }

    #[test]
    fn test_submit_rejects_channel_mismatch() {
        let mut adapter = PlaybackSinkAdapter::new(MemoryOutput::new(2));
        let chunk = SampleChunk::new(0.0, 1.0, 1, vec![0.0; 4]);

        let result = adapter.submit(chunk);
        assert!(matches!(
            result,
            Err(SinkError::ChannelMismatch {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_submit_reclaims_finished_buffers() {
        let mut adapter = PlaybackSinkAdapter::new(MemoryOutput::new(2));
        for i in 0..3 {
            let chunk = SampleChunk::new(i as f64, 1.0, 2, vec![0.0; 4]);
            adapter.submit(chunk).unwrap();
        }
        assert_eq!(adapter.released(), 3);
    }
}
