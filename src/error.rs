// src/error.rs
//
// Error types for every layer of the engine.

use thiserror::Error;

/// Invalid or unreadable configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("sample rate must be positive and finite, got {0}")]
    SampleRate(f64),

    #[error("chunk duration must be positive and finite, got {0}")]
    ChunkDuration(f64),

    #[error("workgroup size must be at least 1")]
    WorkgroupSize,

    #[error("max buffered chunks must be at least 1")]
    MaxBufferedChunks,

    #[error("only 2 output channels are supported, got {0}")]
    Channels(usize),

    #[error("pipeline depth must be between 1 and 4, got {0}")]
    PipelineDepth(usize),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a compute backend.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// No usable compute device.
    #[error("compute device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device went away after it was acquired.
    #[error("compute device lost: {0}")]
    DeviceLost(String),

    /// The kernel failed to compile or validate.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// The backend cannot run this kind of kernel source.
    #[error("backend cannot run kernel '{0}'")]
    UnsupportedKernel(String),

    /// Host mapping of a read-back buffer failed.
    #[error("buffer mapping failed: {0}")]
    Mapping(String),

    /// A buffer was used in a role it was not created for.
    #[error("invalid buffer use: {0}")]
    InvalidBuffer(String),
}

/// Failures of a single synthesis dispatch.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// Device buffers have not been (re)built yet.
    #[error("device buffers not ready")]
    BufferNotReady,

    /// The read-back slot is still mapped from an earlier chunk.
    #[error("read-back slot {0} is still mapped")]
    ReadbackBusy(usize),

    /// The mapped range was shorter than one chunk.
    #[error("read-back returned {got} bytes, expected {expected}")]
    ShortRead { got: usize, expected: usize },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Failures of an audio output.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("output expects {expected} channels, chunk has {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("output holds {capacity} chunks, configuration needs {needed}")]
    QueueCapacity { needed: usize, capacity: usize },

    #[error("audio device error: {0}")]
    Device(String),

    #[error("output io error: {0}")]
    Io(String),

    #[error("output is closed")]
    Closed,
}

impl From<hound::Error> for SinkError {
    fn from(err: hound::Error) -> Self {
        SinkError::Io(err.to_string())
    }
}

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The engine was used outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The scheduler task panicked or was cancelled.
    #[error("scheduler task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    /// Whether this error ends an engine run.
    ///
    /// Missing buffers are retried on the next tick; everything else stops.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::Dispatch(DispatchError::BufferNotReady))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
