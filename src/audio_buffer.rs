// src/audio_buffer.rs

/// Owned multichannel audio in planar layout.
///
/// Channel `c` occupies `data[c * frames .. (c + 1) * frames]`.
/// This is the layout audio output devices consume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanarBuffer {
    pub channels: usize,
    pub frames: usize,
    data: Vec<f32>,
}

impl PlanarBuffer {
    /// Allocate a silent buffer.
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels,
            frames,
            data: vec![0.0; channels * frames],
        }
    }

    #[inline]
    pub fn channel(&self, ch: usize) -> &[f32] {
        let start = ch * self.frames;
        &self.data[start..start + self.frames]
    }

    #[inline]
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        let start = ch * self.frames;
        &mut self.data[start..start + self.frames]
    }

    /// Sample `frame` of channel `ch`, or silence past the end.
    #[inline]
    pub fn sample_or_silence(&self, ch: usize, frame: usize) -> f32 {
        if ch < self.channels && frame < self.frames {
            self.data[ch * self.frames + frame]
        } else {
            0.0
        }
    }
}
