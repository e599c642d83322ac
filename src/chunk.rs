// src/chunk.rs

use crate::audio_buffer::PlanarBuffer;

/// A time-stamped block of synthesized audio.
///
/// Samples are interleaved frame by frame: `[L0, R0, L1, R1, ...]`.
/// Created by the dispatcher after a successful read-back and consumed
/// by the playback sink adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleChunk {
    /// Timeline position of the first frame, in seconds.
    pub start_time: f64,

    /// Length of the chunk in seconds.
    pub duration: f64,

    /// Number of interleaved channels.
    pub channels: usize,

    /// Interleaved sample data.
    pub data: Vec<f32>,
}

impl SampleChunk {
    pub fn new(start_time: f64, duration: f64, channels: usize, data: Vec<f32>) -> Self {
        Self {
            start_time,
            duration,
            channels,
            data,
        }
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.data.len() / self.channels.max(1)
    }

    /// Timeline position just past the last frame.
    #[inline]
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Sample `frame` of channel `ch`.
    #[inline]
    pub fn sample(&self, frame: usize, ch: usize) -> f32 {
        self.data[frame * self.channels + ch]
    }

    /// Split into one contiguous buffer per channel.
    ///
    /// `out.channel(c)[i] == data[i * channels + c]`.
    pub fn deinterleave(&self) -> PlanarBuffer {
        let frames = self.frames();
        let mut out = PlanarBuffer::new(self.channels, frames);
        for ch in 0..self.channels {
            let dest = out.channel_mut(ch);
            for (i, sample) in dest.iter_mut().enumerate() {
                *sample = self.data[i * self.channels + ch];
            }
        }
        out
    }

    /// Absolute peak per channel (first two channels).
    pub fn peaks(&self) -> [f32; 2] {
        let mut peaks = [0.0f32; 2];
        for frame in self.data.chunks_exact(self.channels.max(1)) {
            for (peak, sample) in peaks.iter_mut().zip(frame.iter()) {
                *peak = peak.max(sample.abs());
            }
        }
        peaks
    }
}
