// src/lib.rs
//
// Library entry point.
//
// Chunked real-time synthesis: a compute kernel renders fixed-size blocks
// of interleaved audio, the blocks are read back from device memory and
// scheduled on an audio output ahead of the wall clock.

mod audio_buffer;
mod chunk;
mod config;
mod dispatcher;
mod engine;
mod error;
mod kernel;
mod params;
mod scheduler;
mod status;
mod timeline;

pub mod backend;
pub mod sink;

pub use audio_buffer::PlanarBuffer;
pub use chunk::SampleChunk;
pub use config::{ChunkLayout, EngineConfig, MAX_PIPELINE_DEPTH, SAMPLE_WIDTH, SUPPORTED_CHANNELS};
pub use dispatcher::{Dispatcher, PendingChunk};
pub use engine::Engine;
pub use error::{BackendError, ConfigError, DispatchError, EngineError, EngineResult, SinkError};
pub use kernel::{
    ChunkTime, KernelBinding, KernelConstants, KernelContext, KernelProgram, KernelSource,
};
pub use params::ParameterChannel;
pub use scheduler::RunReport;
pub use status::{EngineState, EngineStatus};
pub use timeline::{Decision, Timeline};
