// src/sink/wav.rs
//
// Offline output: renders the timeline into a 32-bit float WAV file.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::AudioOutput;
use crate::audio_buffer::PlanarBuffer;
use crate::error::SinkError;

type Writer = hound::WavWriter<BufWriter<File>>;

/// Writes scheduled buffers to a WAV file at their timeline positions.
///
/// Buffers must arrive in timeline order. Gaps are filled with silence;
/// frames overlapping audio already written are dropped.
pub struct WavOutput {
    path: PathBuf,
    writer: Option<Writer>,
    channels: usize,
    sample_rate: f64,

    /// Frames written so far.
    written: u64,

    /// File frame where the current run starts.
    run_origin: u64,

    unreleased: usize,
}

impl WavOutput {
    pub fn create(
        path: impl AsRef<Path>,
        sample_rate: f64,
        channels: usize,
    ) -> Result<Self, SinkError> {
        let spec = hound::WavSpec {
            channels: channels as u16,
            sample_rate: sample_rate.round() as u32,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)?;

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            writer: Some(writer),
            channels,
            sample_rate,
            written: 0,
            run_origin: 0,
            unreleased: 0,
        })
    }

    /// Frames written so far.
    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioOutput for WavOutput {
    fn channels(&self) -> usize {
        self.channels
    }

    fn begin_run(&mut self) -> Result<(), SinkError> {
        if self.writer.is_none() {
            return Err(SinkError::Closed);
        }
        self.run_origin = self.written;
        Ok(())
    }

    fn schedule(&mut self, start_time: f64, buffer: PlanarBuffer) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        let start_frame = self.run_origin + (start_time * self.sample_rate).round() as u64;

        // Silence up to the buffer start
        for _ in self.written..start_frame {
            for _ in 0..self.channels {
                writer.write_sample(0.0f32)?;
            }
        }
        self.written = self.written.max(start_frame);

        let skip = (self.written - start_frame) as usize;
        if skip > 0 {
            warn!(
                "Buffer at {:.3}s overlaps written audio, dropping {} frame(s)",
                start_time,
                skip.min(buffer.frames)
            );
        }

        for frame in skip..buffer.frames {
            for ch in 0..self.channels {
                writer.write_sample(buffer.sample_or_silence(ch, frame))?;
            }
            self.written += 1;
        }

        self.unreleased += 1;
        Ok(())
    }

    fn reclaim(&mut self) -> usize {
        std::mem::take(&mut self.unreleased)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.unreleased = 0;
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            info!(
                "Wrote {} frames ({:.2}s) to {}",
                self.written,
                self.written as f64 / self.sample_rate,
                self.path.display()
            );
        }
        Ok(())
    }
}

impl Drop for WavOutput {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Failed to finalize {}: {}", self.path.display(), err);
        }
    }
}
