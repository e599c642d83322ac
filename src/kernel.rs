// src/kernel.rs
//
// Synthesis kernels and the device resources bound to them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::backend::{BufferRole, BufferSpec, ComputeBackend};
use crate::config::{ChunkLayout, SAMPLE_WIDTH};
use crate::error::BackendError;

/// Chunk start time as the kernel sees it.
///
/// Whole seconds and the remainder are stored separately so that the
/// start time keeps sub-sample precision however long the engine runs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ChunkTime {
    pub whole_seconds: u32,

    /// In `[0, 1)`.
    pub fraction: f32,
}

impl ChunkTime {
    /// Size of the device buffer holding a `ChunkTime`.
    pub const BYTES: u64 = std::mem::size_of::<ChunkTime>() as u64;

    pub fn from_seconds(seconds: f64) -> Self {
        let whole = seconds.max(0.0).floor();
        Self {
            whole_seconds: whole as u32,
            fraction: (seconds.max(0.0) - whole) as f32,
        }
    }

    #[inline]
    pub fn seconds(&self) -> f64 {
        self.whole_seconds as f64 + self.fraction as f64
    }
}

/// Per-group invocation data handed to a native kernel.
pub struct KernelContext<'a> {
    /// Chunk start time.
    pub time: ChunkTime,

    /// Index of the first frame this group writes, relative to the chunk.
    pub first_frame: usize,

    /// Current parameter values.
    pub params: &'a [f32],

    pub constants: &'a KernelConstants,
}

impl KernelContext<'_> {
    /// Timeline time of frame `i` within this group.
    #[inline]
    pub fn time_at(&self, i: usize) -> f64 {
        self.time.seconds() + self.chunk_time_at(i) as f64
    }

    /// Seconds from the chunk start to frame `i` within this group.
    #[inline]
    pub fn chunk_time_at(&self, i: usize) -> f32 {
        (self.first_frame + i) as f32 / self.constants.sample_rate
    }
}

/// A kernel implemented in Rust.
///
/// Writes interleaved frames for one group into `out`
/// (`out.len() == frames_in_group * channels`).
pub type NativeKernel = Arc<dyn Fn(&KernelContext<'_>, &mut [f32]) + Send + Sync>;

/// Source of a synthesis kernel.
#[derive(Clone)]
pub enum KernelSource {
    /// WGSL compute shader for device backends.
    Wgsl { source: String, entry_point: String },

    /// Rust function for the CPU backend.
    Native(NativeKernel),
}

impl fmt::Debug for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSource::Wgsl { entry_point, .. } => f
                .debug_struct("Wgsl")
                .field("entry_point", entry_point)
                .finish_non_exhaustive(),
            KernelSource::Native(_) => f.write_str("Native"),
        }
    }
}

/// A synthesis program as handed to the engine.
#[derive(Debug, Clone)]
pub struct KernelProgram {
    pub label: String,
    pub source: KernelSource,

    /// Number of f32 control values the kernel reads. 0 means no
    /// parameter buffer is created.
    pub param_count: usize,
}

impl KernelProgram {
    pub fn wgsl(
        label: impl Into<String>,
        source: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            source: KernelSource::Wgsl {
                source: source.into(),
                entry_point: entry_point.into(),
            },
            param_count: 0,
        }
    }

    pub fn native<F>(label: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(&KernelContext<'_>, &mut [f32]) + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            source: KernelSource::Native(Arc::new(kernel)),
            param_count: 0,
        }
    }

    pub fn with_params(mut self, count: usize) -> Self {
        self.param_count = count;
        self
    }
}

/// Named numeric constants baked into a compiled kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelConstants {
    pub sample_rate: f32,
    pub workgroup_size: u32,
    pub chunk_frames: u32,
    pub channels: u32,
}

impl KernelConstants {
    pub fn from_layout(layout: &ChunkLayout) -> Self {
        Self {
            sample_rate: layout.sample_rate as f32,
            workgroup_size: layout.workgroup_size,
            chunk_frames: layout.frames as u32,
            channels: layout.channels as u32,
        }
    }

    /// WGSL declarations prepended to device kernel source.
    pub fn wgsl_prelude(&self) -> String {
        format!(
            "const SAMPLE_RATE: f32 = {:?};\n\
             const WORKGROUP_SIZE: u32 = {}u;\n\
             const CHUNK_FRAMES: u32 = {}u;\n\
             const NUM_CHANNELS: u32 = {}u;\n",
            self.sample_rate, self.workgroup_size, self.chunk_frames, self.channels
        )
    }
}

//
// ===============================
// MARK: Kernel binding
// ===============================
//

/// One host-mappable copy destination.
pub struct ReadbackSlot<B: ComputeBackend> {
    pub(crate) buffer: Arc<B::Buffer>,

    /// Set from map request until the buffer is unmapped again.
    pub(crate) mapped: Arc<AtomicBool>,
}

impl<B: ComputeBackend> ReadbackSlot<B> {
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }
}

/// The compiled program and every device buffer one configuration needs.
///
/// Built all at once and dropped all at once; there is no partial resize.
/// Output and read-back buffers are always `layout.byte_len()` bytes.
pub struct KernelBinding<B: ComputeBackend> {
    pub(crate) layout: ChunkLayout,
    pub(crate) program: B::Program,
    pub(crate) time_offset: B::Buffer,
    pub(crate) output: B::Buffer,
    pub(crate) params: Option<Arc<B::Buffer>>,
    pub(crate) slots: Vec<ReadbackSlot<B>>,
    pub(crate) next_slot: usize,
}

impl<B: ComputeBackend> KernelBinding<B> {
    /// Compile `program` and create its buffers for `layout`.
    ///
    /// `depth` read-back slots are created. On error everything created so
    /// far is dropped.
    pub fn build(
        backend: &B,
        program: &KernelProgram,
        layout: ChunkLayout,
        depth: usize,
    ) -> Result<Self, BackendError> {
        let groups = layout.groups();
        if groups > backend.max_workgroups() {
            return Err(BackendError::Kernel(format!(
                "{} frames in groups of {} needs {} workgroups, device allows {}",
                layout.frames,
                layout.workgroup_size,
                groups,
                backend.max_workgroups()
            )));
        }

        let constants = KernelConstants::from_layout(&layout);
        let compiled = backend.compile(program, &constants)?;

        let time_offset = backend.create_buffer(&BufferSpec {
            label: "time offset",
            role: BufferRole::TimeOffset,
            size: ChunkTime::BYTES,
        })?;

        let output = backend.create_buffer(&BufferSpec {
            label: "synthesis output",
            role: BufferRole::Output,
            size: layout.byte_len(),
        })?;

        let params = if program.param_count > 0 {
            let buffer = backend.create_buffer(&BufferSpec {
                label: "kernel parameters",
                role: BufferRole::Parameters,
                size: (program.param_count * SAMPLE_WIDTH) as u64,
            })?;
            Some(Arc::new(buffer))
        } else {
            None
        };

        let mut slots = Vec::with_capacity(depth.max(1));
        for _ in 0..depth.max(1) {
            let buffer = backend.create_buffer(&BufferSpec {
                label: "read-back",
                role: BufferRole::Readback,
                size: layout.byte_len(),
            })?;
            slots.push(ReadbackSlot {
                buffer: Arc::new(buffer),
                mapped: Arc::new(AtomicBool::new(false)),
            });
        }

        debug!(
            "Built kernel binding '{}' on {}: {} frames, {} bytes, {} groups, {} read-back slot(s)",
            program.label,
            backend.name(),
            layout.frames,
            layout.byte_len(),
            groups,
            slots.len()
        );

        Ok(Self {
            layout,
            program: compiled,
            time_offset,
            output,
            params,
            slots,
            next_slot: 0,
        })
    }

    #[inline]
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Parameter buffer, if the kernel reads parameters.
    #[inline]
    pub fn params(&self) -> Option<&Arc<B::Buffer>> {
        self.params.as_ref()
    }

    /// Whether no read-back mapping is outstanding.
    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|slot| !slot.is_mapped())
    }

    /// Number of read-back slots currently mapped.
    pub fn mapped_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_mapped()).count()
    }
}

impl<B: ComputeBackend> Drop for KernelBinding<B> {
    fn drop(&mut self) {
        debug_assert!(
            self.is_idle(),
            "kernel binding released with {} mapping(s) outstanding",
            self.mapped_slots()
        );
    }
}
