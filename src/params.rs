// src/params.rs
//
// Control values flowing from the host into the kernel's parameter buffer.

use std::sync::Arc;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::backend::ComputeBackend;
use crate::error::BackendError;

struct ParamSlot<B: ComputeBackend> {
    /// Bound parameter buffer, absent while buffers are being rebuilt.
    buffer: Option<Arc<B::Buffer>>,

    /// Last values written, re-uploaded after a rebuild.
    values: Vec<f32>,

    /// Number of f32 values the kernel reads.
    capacity: usize,
}

/// Handle for writing kernel parameters while the engine runs.
///
/// Cheap to clone. Writes go straight to the device buffer; the next
/// dispatch sees them. When the binding is rebuilt the last written values
/// are uploaded to the new buffer before it is used.
pub struct ParameterChannel<B: ComputeBackend> {
    backend: Arc<B>,
    slot: Arc<Mutex<ParamSlot<B>>>,
}

impl<B: ComputeBackend> Clone for ParameterChannel<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<B: ComputeBackend> ParameterChannel<B> {
    pub fn new(backend: Arc<B>, capacity: usize) -> Self {
        Self {
            backend,
            slot: Arc::new(Mutex::new(ParamSlot {
                buffer: None,
                values: Vec::new(),
                capacity,
            })),
        }
    }

    /// Number of values the kernel reads.
    pub fn capacity(&self) -> usize {
        self.slot.lock().capacity
    }

    /// Write control values for subsequent dispatches.
    ///
    /// Values past the kernel's parameter count are dropped. With no
    /// buffer bound the values are kept and uploaded on the next attach.
    pub fn set_parameters(&self, values: &[f32]) -> Result<(), BackendError> {
        let mut slot = self.slot.lock();

        let kept = if values.len() > slot.capacity {
            warn!(
                "Kernel reads {} parameter(s), dropping {} extra value(s)",
                slot.capacity,
                values.len() - slot.capacity
            );
            &values[..slot.capacity]
        } else {
            values
        };

        slot.values.clear();
        slot.values.extend_from_slice(kept);

        match &slot.buffer {
            Some(buffer) if !kept.is_empty() => {
                self.backend
                    .write_buffer(buffer, bytemuck::cast_slice(kept))?;
                trace!("Uploaded {} parameter(s)", kept.len());
            }
            Some(_) => {}
            None => trace!("Parameters held until buffers are bound"),
        }
        Ok(())
    }

    /// Last values written.
    pub fn values(&self) -> Vec<f32> {
        self.slot.lock().values.clone()
    }

    /// Bind a freshly built parameter buffer and upload the held values.
    pub(crate) fn attach(&self, buffer: Option<Arc<B::Buffer>>) -> Result<(), BackendError> {
        let mut slot = self.slot.lock();
        if let Some(buffer) = &buffer {
            if !slot.values.is_empty() {
                self.backend
                    .write_buffer(buffer, bytemuck::cast_slice(slot.values.as_slice()))?;
            }
        }
        slot.buffer = buffer;
        Ok(())
    }

    /// Unbind the current buffer ahead of a rebuild or shutdown.
    pub(crate) fn detach(&self) {
        self.slot.lock().buffer = None;
    }

    /// Whether a parameter buffer is currently bound.
    pub fn is_attached(&self) -> bool {
        self.slot.lock().buffer.is_some()
    }
}
