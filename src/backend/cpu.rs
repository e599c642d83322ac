// src/backend/cpu.rs
//
// Host-side backend that runs native kernels group by group.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{BufferRole, BufferSpec, ComputeBackend, SynthesisWork};
use crate::config::SAMPLE_WIDTH;
use crate::error::BackendError;
use crate::kernel::{
    ChunkTime, KernelConstants, KernelContext, KernelProgram, KernelSource, NativeKernel,
};

/// Compiled form of a native kernel.
pub struct CpuProgram {
    kernel: NativeKernel,
    constants: KernelConstants,
}

/// Host memory standing in for a device buffer.
///
/// Stored as 32-bit words; every engine buffer is a whole number of samples.
pub struct CpuBuffer {
    label: &'static str,
    role: BufferRole,
    words: Mutex<Vec<f32>>,
    mapped: AtomicBool,
}

impl CpuBuffer {
    #[inline]
    pub fn role(&self) -> BufferRole {
        self.role
    }

    #[inline]
    pub fn len_bytes(&self) -> u64 {
        (self.words.lock().len() * SAMPLE_WIDTH) as u64
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Snapshot of the buffer contents.
    pub fn to_vec(&self) -> Vec<f32> {
        self.words.lock().clone()
    }
}

/// Software compute backend.
#[derive(Debug, Default, Clone)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }

    /// Map, copy out and unmap in one step.
    pub(crate) fn read_mapped(buffer: &CpuBuffer, len: u64) -> Result<Vec<u8>, BackendError> {
        if buffer.role != BufferRole::Readback {
            return Err(BackendError::InvalidBuffer(format!(
                "'{}' is not a read-back buffer",
                buffer.label
            )));
        }
        if buffer.mapped.swap(true, Ordering::AcqRel) {
            return Err(BackendError::Mapping(format!(
                "'{}' is already mapped",
                buffer.label
            )));
        }

        let bytes = {
            let words = buffer.words.lock();
            let all: &[u8] = bytemuck::cast_slice(words.as_slice());
            let len = (len as usize).min(all.len());
            all[..len].to_vec()
        };

        buffer.mapped.store(false, Ordering::Release);
        Ok(bytes)
    }

    fn run_kernel(
        program: &CpuProgram,
        groups: u32,
        time: ChunkTime,
        params: &[f32],
        output: &mut [f32],
    ) {
        let constants = &program.constants;
        let channels = constants.channels as usize;
        let group_frames = constants.workgroup_size as usize;
        let frames = output.len() / channels.max(1);

        for group in 0..groups as usize {
            let first_frame = group * group_frames;
            if first_frame >= frames {
                break;
            }
            let last_frame = (first_frame + group_frames).min(frames);
            let ctx = KernelContext {
                time,
                first_frame,
                params,
                constants,
            };
            (program.kernel)(&ctx, &mut output[first_frame * channels..last_frame * channels]);
        }
    }
}

impl ComputeBackend for CpuBackend {
    type Program = CpuProgram;
    type Buffer = CpuBuffer;

    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn compile(
        &self,
        program: &KernelProgram,
        constants: &KernelConstants,
    ) -> Result<CpuProgram, BackendError> {
        match &program.source {
            KernelSource::Native(kernel) => Ok(CpuProgram {
                kernel: Arc::clone(kernel),
                constants: *constants,
            }),
            KernelSource::Wgsl { .. } => Err(BackendError::UnsupportedKernel(program.label.clone())),
        }
    }

    fn create_buffer(&self, spec: &BufferSpec) -> Result<CpuBuffer, BackendError> {
        if spec.size % SAMPLE_WIDTH as u64 != 0 {
            return Err(BackendError::InvalidBuffer(format!(
                "'{}' size {} is not a multiple of {}",
                spec.label, spec.size, SAMPLE_WIDTH
            )));
        }
        Ok(CpuBuffer {
            label: spec.label,
            role: spec.role,
            words: Mutex::new(vec![0.0; spec.size as usize / SAMPLE_WIDTH]),
            mapped: AtomicBool::new(false),
        })
    }

    fn write_buffer(&self, buffer: &CpuBuffer, data: &[u8]) -> Result<(), BackendError> {
        if !buffer.role.host_writable() {
            return Err(BackendError::InvalidBuffer(format!(
                "'{}' is not host-writable",
                buffer.label
            )));
        }
        if data.len() % SAMPLE_WIDTH != 0 {
            return Err(BackendError::InvalidBuffer(format!(
                "write of {} bytes into '{}' is not word aligned",
                data.len(),
                buffer.label
            )));
        }

        let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
        let mut words = buffer.words.lock();
        if values.len() > words.len() {
            return Err(BackendError::InvalidBuffer(format!(
                "write of {} bytes overflows '{}'",
                data.len(),
                buffer.label
            )));
        }
        words[..values.len()].copy_from_slice(&values);
        Ok(())
    }

    fn submit(&self, work: SynthesisWork<'_, Self>) -> Result<(), BackendError> {
        if work.readback.is_mapped() {
            return Err(BackendError::InvalidBuffer(format!(
                "copy into mapped buffer '{}'",
                work.readback.label
            )));
        }

        let time = {
            let words = work.time_offset.words.lock();
            match words.as_slice() {
                [whole, fraction, ..] => ChunkTime {
                    whole_seconds: whole.to_bits(),
                    fraction: *fraction,
                },
                _ => ChunkTime::default(),
            }
        };
        let params = work.params.map(|p| p.to_vec()).unwrap_or_default();

        let mut output = work.output.words.lock();
        Self::run_kernel(work.program, work.groups, time, &params, &mut output);

        let copy_words = (work.copy_len as usize / SAMPLE_WIDTH).min(output.len());
        let mut readback = work.readback.words.lock();
        if copy_words > readback.len() {
            return Err(BackendError::InvalidBuffer(format!(
                "copy of {} bytes overflows '{}'",
                work.copy_len, work.readback.label
            )));
        }
        readback[..copy_words].copy_from_slice(&output[..copy_words]);
        Ok(())
    }

    fn map_read(
        &self,
        buffer: Arc<CpuBuffer>,
        len: u64,
    ) -> impl Future<Output = Result<Vec<u8>, BackendError>> + Send + 'static {
        std::future::ready(Self::read_mapped(&buffer, len))
    }
}
