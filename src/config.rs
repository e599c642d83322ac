// src/config.rs
//
// Engine configuration and the chunk layout derived from it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bytes per sample on the device and on the host (f32).
pub const SAMPLE_WIDTH: usize = std::mem::size_of::<f32>();

/// The only channel count the engine supports.
pub const SUPPORTED_CHANNELS: usize = 2;

/// Largest supported number of read-back slots.
pub const MAX_PIPELINE_DEPTH: usize = 4;

/// Output slots on top of the chunks backpressure lets run ahead: the chunk
/// playing now and one for drift between the device and host clocks.
const OUTPUT_QUEUE_SLACK: usize = 2;

/// Recognized engine options.
///
/// Field names follow the camelCase option names used by the control layer,
/// so a JSON document like `{"sampleRate": 48000, "chunkDurationSeconds": 0.5}`
/// deserializes directly. Missing fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: f64,

    /// Duration of one synthesized chunk in seconds.
    pub chunk_duration_seconds: f64,

    /// Threads per compute group.
    pub workgroup_size: u32,

    /// How many chunks may be buffered ahead of the wall clock.
    pub max_buffered_chunks: u32,

    /// Output channel count (must be 2).
    pub num_channels: usize,

    /// Number of read-back slots. 1 is single-buffered.
    pub pipeline_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100.0,
            chunk_duration_seconds: 1.0,
            workgroup_size: 64,
            max_buffered_chunks: 1,
            num_channels: SUPPORTED_CHANNELS,
            pipeline_depth: 1,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }
        if !self.chunk_duration_seconds.is_finite() || self.chunk_duration_seconds <= 0.0 {
            return Err(ConfigError::ChunkDuration(self.chunk_duration_seconds));
        }
        if self.workgroup_size == 0 {
            return Err(ConfigError::WorkgroupSize);
        }
        if self.max_buffered_chunks == 0 {
            return Err(ConfigError::MaxBufferedChunks);
        }
        if self.num_channels != SUPPORTED_CHANNELS {
            return Err(ConfigError::Channels(self.num_channels));
        }
        if self.pipeline_depth == 0 || self.pipeline_depth > MAX_PIPELINE_DEPTH {
            return Err(ConfigError::PipelineDepth(self.pipeline_depth));
        }
        Ok(())
    }

    /// Derive the device-side sizing for this configuration.
    pub fn layout(&self) -> ChunkLayout {
        let frames = (self.sample_rate * self.chunk_duration_seconds).round().max(1.0) as usize;
        ChunkLayout {
            sample_rate: self.sample_rate,
            frames,
            channels: self.num_channels,
            workgroup_size: self.workgroup_size,
        }
    }

    /// Chunks an audio output must hold at once, queued or playing.
    pub fn output_queue_depth(&self) -> usize {
        self.max_buffered_chunks as usize + self.pipeline_depth + OUTPUT_QUEUE_SLACK
    }

    /// Whether switching to `other` requires new device buffers.
    pub fn requires_rebuild(&self, other: &EngineConfig) -> bool {
        self.layout() != other.layout() || self.pipeline_depth != other.pipeline_depth
    }
}

/// Sizing of one synthesis dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkLayout {
    pub sample_rate: f64,
    pub frames: usize,
    pub channels: usize,
    pub workgroup_size: u32,
}

impl ChunkLayout {
    /// Interleaved sample count of one chunk.
    #[inline]
    pub fn samples(&self) -> usize {
        self.frames * self.channels
    }

    /// Size of the output and read-back buffers.
    #[inline]
    pub fn byte_len(&self) -> u64 {
        (self.samples() * SAMPLE_WIDTH) as u64
    }

    /// Number of compute groups covering every frame.
    #[inline]
    pub fn groups(&self) -> u32 {
        (self.frames as u32).div_ceil(self.workgroup_size)
    }

    /// Timeline duration of one chunk, exact to the sample.
    #[inline]
    pub fn duration(&self) -> f64 {
        self.frames as f64 / self.sample_rate
    }
}
