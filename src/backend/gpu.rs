// src/backend/gpu.rs
//
// wgpu compute backend.
//
// Kernels are WGSL compute shaders. The engine prepends the named constants
// (SAMPLE_RATE, WORKGROUP_SIZE, CHUNK_FRAMES, NUM_CHANNELS) and expects the
// shader to use these bindings in group 0:
//
//   struct ChunkTime { whole_seconds: u32, fraction: f32 }
//   @binding(0) var<storage, read> chunk_time: ChunkTime;
//   @binding(1) var<storage, read_write> output: array<f32>;
//   @binding(2) var<storage, read> params: array<f32>;   // only if param_count > 0

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::oneshot::{self, error::TryRecvError};

use super::{BufferRole, BufferSpec, ComputeBackend, SynthesisWork};
use crate::error::BackendError;
use crate::kernel::{KernelConstants, KernelProgram, KernelSource};

/// How often an outstanding mapping polls the device.
const MAP_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct WgpuProgram {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    uses_params: bool,
}

pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    role: BufferRole,
    size: u64,
}

impl WgpuBuffer {
    #[inline]
    pub fn len_bytes(&self) -> u64 {
        self.size
    }
}

/// GPU backend built on a wgpu device and queue.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    adapter_name: String,
}

impl WgpuBackend {
    /// Acquire the first high-performance adapter and open a device on it.
    pub async fn new() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|err| BackendError::DeviceUnavailable(err.to_string()))?;

        let adapter_info = adapter.get_info();
        info!(
            "Using GPU adapter \"{}\" ({:?}, {:?})",
            adapter_info.name, adapter_info.backend, adapter_info.device_type
        );

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gpusynth device"),
                ..Default::default()
            })
            .await
            .map_err(|err| BackendError::DeviceUnavailable(err.to_string()))?;

        Ok(Self {
            device: Arc::new(device),
            queue,
            adapter_name: adapter_info.name,
        })
    }

    /// Create with blocking initialization.
    pub fn new_blocking() -> Result<Self, BackendError> {
        pollster::block_on(Self::new())
    }

    fn usage(role: BufferRole) -> wgpu::BufferUsages {
        match role {
            BufferRole::TimeOffset | BufferRole::Parameters => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST
            }
            BufferRole::Output => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            BufferRole::Readback => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        }
    }

    /// Run `f` inside a validation error scope.
    fn validated<T>(&self, f: impl FnOnce() -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }
}

impl ComputeBackend for WgpuBackend {
    type Program = WgpuProgram;
    type Buffer = WgpuBuffer;

    fn name(&self) -> String {
        self.adapter_name.clone()
    }

    fn compile(
        &self,
        program: &KernelProgram,
        constants: &KernelConstants,
    ) -> Result<WgpuProgram, BackendError> {
        let KernelSource::Wgsl {
            source,
            entry_point,
        } = &program.source
        else {
            return Err(BackendError::UnsupportedKernel(program.label.clone()));
        };

        let full_source = format!("{}\n{}", constants.wgsl_prelude(), source);
        debug!(
            "Compiling kernel '{}' (entry point '{}')",
            program.label, entry_point
        );

        let pipeline = self
            .validated(|| {
                let module = self
                    .device
                    .create_shader_module(wgpu::ShaderModuleDescriptor {
                        label: Some(program.label.as_str()),
                        source: wgpu::ShaderSource::Wgsl(full_source.into()),
                    });
                self.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(program.label.as_str()),
                        layout: None,
                        module: &module,
                        entry_point: Some(entry_point.as_str()),
                        compilation_options: Default::default(),
                        cache: None,
                    })
            })
            .map_err(BackendError::Kernel)?;

        let layout = pipeline.get_bind_group_layout(0);
        Ok(WgpuProgram {
            pipeline,
            layout,
            uses_params: program.param_count > 0,
        })
    }

    fn max_workgroups(&self) -> u32 {
        self.device.limits().max_compute_workgroups_per_dimension
    }

    fn create_buffer(&self, spec: &BufferSpec) -> Result<WgpuBuffer, BackendError> {
        let buffer = self
            .validated(|| {
                self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(spec.label),
                    size: spec.size,
                    usage: Self::usage(spec.role),
                    mapped_at_creation: false,
                })
            })
            .map_err(BackendError::InvalidBuffer)?;

        Ok(WgpuBuffer {
            buffer,
            role: spec.role,
            size: spec.size,
        })
    }

    fn write_buffer(&self, buffer: &WgpuBuffer, data: &[u8]) -> Result<(), BackendError> {
        if !buffer.role.host_writable() {
            return Err(BackendError::InvalidBuffer(format!(
                "{:?} buffer is not host-writable",
                buffer.role
            )));
        }
        if data.len() as u64 > buffer.size {
            return Err(BackendError::InvalidBuffer(format!(
                "write of {} bytes overflows {} byte buffer",
                data.len(),
                buffer.size
            )));
        }
        self.queue.write_buffer(&buffer.buffer, 0, data);
        Ok(())
    }

    fn submit(&self, work: SynthesisWork<'_, Self>) -> Result<(), BackendError> {
        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: work.time_offset.buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: work.output.buffer.as_entire_binding(),
            },
        ];
        if work.program.uses_params {
            let params = work.params.ok_or_else(|| {
                BackendError::InvalidBuffer("kernel reads parameters but none are bound".into())
            })?;
            entries.push(wgpu::BindGroupEntry {
                binding: 2,
                resource: params.buffer.as_entire_binding(),
            });
        }

        self.validated(|| {
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("synthesis bindings"),
                layout: &work.program.layout,
                entries: &entries,
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("synthesis encoder"),
                });

            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("synthesis pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&work.program.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(work.groups, 1, 1);
            }

            // Same command stream, so the copy runs after the kernel finishes
            encoder.copy_buffer_to_buffer(
                &work.output.buffer,
                0,
                &work.readback.buffer,
                0,
                work.copy_len,
            );

            self.queue.submit(std::iter::once(encoder.finish()));
        })
        .map_err(BackendError::DeviceLost)
    }

    fn map_read(
        &self,
        buffer: Arc<WgpuBuffer>,
        len: u64,
    ) -> impl Future<Output = Result<Vec<u8>, BackendError>> + Send + 'static {
        let device = Arc::clone(&self.device);
        let len = len.min(buffer.size);
        let (tx, mut rx) = oneshot::channel();

        buffer
            .buffer
            .slice(..len)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });

        async move {
            let mapped = loop {
                device
                    .poll(wgpu::PollType::Poll)
                    .map_err(|err| BackendError::DeviceLost(err.to_string()))?;

                match rx.try_recv() {
                    Ok(result) => break result,
                    Err(TryRecvError::Empty) => tokio::time::sleep(MAP_POLL_INTERVAL).await,
                    Err(TryRecvError::Closed) => {
                        return Err(BackendError::Mapping("map callback dropped".into()));
                    }
                }
            };
            mapped.map_err(|err| BackendError::Mapping(err.to_string()))?;

            let bytes = {
                let view = buffer.buffer.slice(..len).get_mapped_range();
                view.to_vec()
            };
            buffer.buffer.unmap();
            Ok(bytes)
        }
    }
}
