// src/backend/probe.rs
//
// Instrumented backend for tests.
//
// Wraps the CPU backend and records every dispatch and mapping with the
// (tokio) time it happened. Mappings can be held open until the test
// releases them, and individual mappings can be made to fail.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::{BufferRole, BufferSpec, ComputeBackend, CpuBackend, CpuBuffer, CpuProgram, SynthesisWork};
use crate::error::BackendError;
use crate::kernel::{KernelConstants, KernelProgram};

#[derive(Debug, Clone)]
pub(crate) struct DispatchRecord {
    pub at: Instant,
    pub time_offset: f64,
    pub readback: usize,
    /// Mappings still unresolved when this dispatch was submitted.
    pub outstanding_maps: usize,
}

#[derive(Default)]
struct ProbeState {
    next_id: AtomicUsize,
    live_buffers: AtomicUsize,
    dispatches: Mutex<Vec<DispatchRecord>>,
    outstanding: Mutex<HashSet<usize>>,
    max_outstanding: AtomicUsize,
    maps_started: AtomicUsize,
    maps_finished: AtomicUsize,
    violations: Mutex<Vec<String>>,
    fail_map: Mutex<Option<usize>>,
    unavailable: AtomicBool,
}

impl ProbeState {
    fn begin_map(&self, id: usize) -> usize {
        let mut outstanding = self.outstanding.lock();
        if !outstanding.insert(id) {
            self.violations
                .lock()
                .push(format!("buffer {id} mapped twice"));
        }
        self.max_outstanding
            .fetch_max(outstanding.len(), Ordering::SeqCst);
        self.maps_started.fetch_add(1, Ordering::SeqCst)
    }

    fn end_map(&self, id: usize) {
        self.outstanding.lock().remove(&id);
        self.maps_finished.fetch_add(1, Ordering::SeqCst);
    }
}

fn chunk_time(words: &[f32]) -> f64 {
    match words {
        [whole, fraction, ..] => whole.to_bits() as f64 + *fraction as f64,
        _ => 0.0,
    }
}

pub(crate) struct ProbeBuffer {
    id: usize,
    inner: CpuBuffer,
    state: Arc<ProbeState>,
}

impl ProbeBuffer {
    pub fn to_vec(&self) -> Vec<f32> {
        self.inner.to_vec()
    }
}

impl Drop for ProbeBuffer {
    fn drop(&mut self) {
        if self.state.outstanding.lock().contains(&self.id) {
            self.state
                .violations
                .lock()
                .push(format!("buffer {} released while mapped", self.id));
        }
        self.state.live_buffers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub(crate) struct ProbeBackend {
    inner: CpuBackend,
    state: Arc<ProbeState>,
    gate: Option<Arc<Semaphore>>,
    workgroup_limit: Option<u32>,
}

impl ProbeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every mapping open until released with [`release_maps`](Self::release_maps).
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    /// Report a per-dispatch group limit like a real device.
    pub fn with_workgroup_limit(limit: u32) -> Self {
        Self {
            workgroup_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Behave as if no device is present.
    pub fn unavailable() -> Self {
        let probe = Self::default();
        probe.state.unavailable.store(true, Ordering::SeqCst);
        probe
    }

    /// Let `count` held mappings complete.
    pub fn release_maps(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    /// Make the mapping with this zero-based sequence number fail.
    pub fn fail_map_number(&self, index: usize) {
        *self.state.fail_map.lock() = Some(index);
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state.dispatches.lock().clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.live_buffers.load(Ordering::SeqCst)
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.violations.lock().clone()
    }

    pub fn max_outstanding_maps(&self) -> usize {
        self.state.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn outstanding_maps(&self) -> usize {
        self.state.outstanding.lock().len()
    }

    pub fn maps_finished(&self) -> usize {
        self.state.maps_finished.load(Ordering::SeqCst)
    }
}

impl ComputeBackend for ProbeBackend {
    type Program = CpuProgram;
    type Buffer = ProbeBuffer;

    fn name(&self) -> String {
        "probe".to_string()
    }

    fn compile(
        &self,
        program: &KernelProgram,
        constants: &KernelConstants,
    ) -> Result<CpuProgram, BackendError> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::DeviceUnavailable("probe has no device".into()));
        }
        self.inner.compile(program, constants)
    }

    fn max_workgroups(&self) -> u32 {
        self.workgroup_limit.unwrap_or(u32::MAX)
    }

    fn create_buffer(&self, spec: &BufferSpec) -> Result<ProbeBuffer, BackendError> {
        let inner = self.inner.create_buffer(spec)?;
        self.state.live_buffers.fetch_add(1, Ordering::SeqCst);
        Ok(ProbeBuffer {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            inner,
            state: Arc::clone(&self.state),
        })
    }

    fn write_buffer(&self, buffer: &ProbeBuffer, data: &[u8]) -> Result<(), BackendError> {
        self.inner.write_buffer(&buffer.inner, data)
    }

    fn submit(&self, work: SynthesisWork<'_, Self>) -> Result<(), BackendError> {
        let outstanding_maps = {
            let outstanding = self.state.outstanding.lock();
            if outstanding.contains(&work.readback.id) {
                self.state
                    .violations
                    .lock()
                    .push(format!("dispatch into mapped buffer {}", work.readback.id));
            }
            outstanding.len()
        };

        debug_assert_eq!(work.readback.inner.role(), BufferRole::Readback);
        self.state.dispatches.lock().push(DispatchRecord {
            at: Instant::now(),
            time_offset: chunk_time(&work.time_offset.to_vec()),
            readback: work.readback.id,
            outstanding_maps,
        });

        self.inner.submit(SynthesisWork {
            program: work.program,
            groups: work.groups,
            time_offset: &work.time_offset.inner,
            output: &work.output.inner,
            params: work.params.map(|p| &p.inner),
            readback: &work.readback.inner,
            copy_len: work.copy_len,
        })
    }

    fn map_read(
        &self,
        buffer: Arc<ProbeBuffer>,
        len: u64,
    ) -> impl Future<Output = Result<Vec<u8>, BackendError>> + Send + 'static {
        let state = Arc::clone(&self.state);
        let gate = self.gate.clone();
        let sequence = state.begin_map(buffer.id);

        async move {
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            let fail = *state.fail_map.lock() == Some(sequence);
            let result = if fail {
                Err(BackendError::Mapping(format!("injected failure on map {sequence}")))
            } else {
                CpuBackend::read_mapped(&buffer.inner, len)
            };

            state.end_map(buffer.id);
            result
        }
    }
}
