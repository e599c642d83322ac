//! Compute device abstraction.
//!
//! The dispatcher drives synthesis through [`ComputeBackend`]. A backend owns
//! the device and its queue; the [`KernelBinding`](crate::kernel::KernelBinding)
//! owns the programs and buffers created from it.
//!
//! Two implementations ship with the crate:
//!
//! - [`CpuBackend`] runs native Rust kernels group by group on the host.
//! - `WgpuBackend` (feature `gpu`) runs WGSL kernels on a GPU.

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;
#[cfg(test)]
pub(crate) mod probe;

pub use cpu::{CpuBackend, CpuBuffer, CpuProgram};
#[cfg(feature = "gpu")]
pub use gpu::{WgpuBackend, WgpuBuffer, WgpuProgram};

use std::future::Future;
use std::sync::Arc;

use crate::error::BackendError;
use crate::kernel::{KernelConstants, KernelProgram};

/// What a device buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Chunk start time ([`ChunkTime`](crate::kernel::ChunkTime)), written
    /// by the host before each dispatch.
    TimeOffset,
    /// Device-local kernel output, copied into a read-back buffer.
    Output,
    /// Host-mappable copy destination.
    Readback,
    /// Host-writable control values.
    Parameters,
}

impl BufferRole {
    /// Whether the host may write this buffer directly.
    #[inline]
    pub fn host_writable(self) -> bool {
        matches!(self, BufferRole::TimeOffset | BufferRole::Parameters)
    }
}

/// Description of one device buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferSpec {
    pub label: &'static str,
    pub role: BufferRole,
    pub size: u64,
}

/// Everything one synthesis submission touches.
///
/// The compute pass and the output -> read-back copy are recorded into the
/// same command stream, so the copy always observes the finished kernel
/// output.
pub struct SynthesisWork<'a, B: ComputeBackend + ?Sized> {
    pub program: &'a B::Program,
    pub groups: u32,
    pub time_offset: &'a B::Buffer,
    pub output: &'a B::Buffer,
    pub params: Option<&'a B::Buffer>,
    pub readback: &'a B::Buffer,
    pub copy_len: u64,
}

/// A compute device that can run one synthesis kernel per chunk.
pub trait ComputeBackend: Send + Sync + 'static {
    type Program: Send + Sync;
    type Buffer: Send + Sync;

    /// Human-readable device name for logs.
    fn name(&self) -> String;

    /// Compile a kernel with its named constants.
    fn compile(
        &self,
        program: &KernelProgram,
        constants: &KernelConstants,
    ) -> Result<Self::Program, BackendError>;

    /// Largest group count one dispatch may use.
    fn max_workgroups(&self) -> u32 {
        u32::MAX
    }

    fn create_buffer(&self, spec: &BufferSpec) -> Result<Self::Buffer, BackendError>;

    /// Host -> device transfer into the start of `buffer`.
    fn write_buffer(&self, buffer: &Self::Buffer, data: &[u8]) -> Result<(), BackendError>;

    /// Submit the compute dispatch followed by the read-back copy.
    fn submit(&self, work: SynthesisWork<'_, Self>) -> Result<(), BackendError>;

    /// Map the first `len` bytes of a read-back buffer for host access.
    ///
    /// The returned future copies the mapped bytes out and unmaps the buffer
    /// before it resolves, so the buffer is reusable once the future is done.
    fn map_read(
        &self,
        buffer: Arc<Self::Buffer>,
        len: u64,
    ) -> impl Future<Output = Result<Vec<u8>, BackendError>> + Send + 'static;
}
