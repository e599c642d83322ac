// src/dispatcher.rs
//
// One compute-and-readback cycle per chunk.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::backend::{ComputeBackend, SynthesisWork};
use crate::chunk::SampleChunk;
use crate::error::{BackendError, DispatchError};
use crate::kernel::{ChunkTime, KernelBinding};

type MapFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, BackendError>> + Send>>;

/// A submitted chunk whose read-back mapping has been requested.
///
/// Resolving it yields the chunk. The read-back slot stays marked as mapped
/// until then, so the dispatcher will not target it again.
#[must_use = "a pending chunk holds its read-back slot until resolved"]
pub struct PendingChunk {
    start_time: f64,
    duration: f64,
    channels: usize,
    expected_bytes: usize,
    slot: usize,
    mapped: Arc<AtomicBool>,
    map: MapFuture,
}

impl PendingChunk {
    #[inline]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Wait for the mapping and build the chunk.
    ///
    /// The slot is released whether the mapping succeeded or not.
    pub async fn resolve(self) -> Result<SampleChunk, DispatchError> {
        let PendingChunk {
            start_time,
            duration,
            channels,
            expected_bytes,
            mapped,
            map,
            ..
        } = self;

        let result = map.await;
        mapped.store(false, Ordering::Release);

        let bytes = result?;
        if bytes.len() < expected_bytes {
            return Err(DispatchError::ShortRead {
                got: bytes.len(),
                expected: expected_bytes,
            });
        }

        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[..expected_bytes]);
        Ok(SampleChunk::new(start_time, duration, channels, data))
    }
}

/// Issues synthesis dispatches against a kernel binding.
pub struct Dispatcher<B: ComputeBackend> {
    backend: Arc<B>,
}

impl<B: ComputeBackend> Dispatcher<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Write the start time, submit compute + copy, and request the mapping.
    ///
    /// Targets the binding's next read-back slot. Fails with `ReadbackBusy`
    /// if that slot's previous mapping has not resolved.
    pub fn issue(
        &self,
        binding: Option<&mut KernelBinding<B>>,
        start_time: f64,
    ) -> Result<PendingChunk, DispatchError> {
        let binding = binding.ok_or(DispatchError::BufferNotReady)?;
        let layout = binding.layout;
        let slot_index = binding.next_slot;

        let slot = &binding.slots[slot_index];
        if slot.is_mapped() {
            return Err(DispatchError::ReadbackBusy(slot_index));
        }

        self.backend
            .write_buffer(
                &binding.time_offset,
                bytemuck::bytes_of(&ChunkTime::from_seconds(start_time)),
            )?;

        self.backend.submit(SynthesisWork {
            program: &binding.program,
            groups: layout.groups(),
            time_offset: &binding.time_offset,
            output: &binding.output,
            params: binding.params.as_deref(),
            readback: &slot.buffer,
            copy_len: layout.byte_len(),
        })?;

        slot.mapped.store(true, Ordering::Release);
        let map = self
            .backend
            .map_read(Arc::clone(&slot.buffer), layout.byte_len());
        let mapped = Arc::clone(&slot.mapped);

        binding.next_slot = (slot_index + 1) % binding.slots.len();

        debug!(
            "Dispatched chunk at {:.3}s ({} groups, slot {})",
            start_time,
            layout.groups(),
            slot_index
        );

        Ok(PendingChunk {
            start_time,
            duration: layout.duration(),
            channels: layout.channels,
            expected_bytes: layout.byte_len() as usize,
            slot: slot_index,
            mapped,
            map: Box::pin(map),
        })
    }

    /// Issue and resolve one chunk.
    pub async fn dispatch(
        &self,
        binding: Option<&mut KernelBinding<B>>,
        start_time: f64,
    ) -> Result<SampleChunk, DispatchError> {
        self.issue(binding, start_time)?.resolve().await
    }
}
