// src/scheduler.rs

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::backend::ComputeBackend;
use crate::chunk::SampleChunk;
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, PendingChunk};
use crate::error::{DispatchError, EngineError};
use crate::kernel::{KernelBinding, KernelProgram};
use crate::params::ParameterChannel;
use crate::sink::{AudioOutput, PlaybackSinkAdapter};
use crate::status::{EngineState, SharedStatus};
use crate::timeline::{Decision, Timeline};

/// Messages from the engine handle to a running scheduler.
#[derive(Debug, Clone)]
pub(crate) enum ControlMessage {
    /// Switch to a new configuration before the next dispatch.
    Reconfigure(EngineConfig),
}

/// Summary of one engine run, from play to stop.
#[derive(Debug)]
pub struct RunReport {
    /// Chunks handed to the output.
    pub chunks_produced: u64,

    /// Timeline position just past the last chunk handed to the output.
    pub final_offset: f64,

    /// Backpressure deferrals.
    pub deferrals: u64,

    /// Device buffer rebuilds after reconfiguration.
    pub rebuilds: u32,

    /// The error that ended the run, if it did not end on request.
    pub fault: Option<EngineError>,
}

impl RunReport {
    /// Whether the run ended on request rather than on a fault.
    pub fn is_clean(&self) -> bool {
        self.fault.is_none()
    }
}

/// What a finished scheduler hands back to the engine.
pub(crate) struct SchedulerExit<O: AudioOutput> {
    pub sink: PlaybackSinkAdapter<O>,
    pub report: RunReport,
}

/// Everything a scheduler run needs.
pub(crate) struct SchedulerParts<B: ComputeBackend, O: AudioOutput> {
    pub backend: Arc<B>,
    pub program: KernelProgram,
    pub config: EngineConfig,
    pub binding: KernelBinding<B>,
    pub sink: PlaybackSinkAdapter<O>,
    pub params: ParameterChannel<B>,
    pub status: Arc<SharedStatus>,
    pub control: mpsc::UnboundedReceiver<ControlMessage>,
    pub stop: watch::Receiver<bool>,
}

/// Produces chunks against the wall clock until stopped.
///
/// Runs as a single task. Each loop iteration evaluates backpressure for
/// the next chunk offset and either dispatches it or sleeps for
/// `duration * 0.9` before looking again. At most `pipeline_depth`
/// chunks are in flight; with the default depth of 1 every dispatch is
/// resolved before the next one is issued.
pub(crate) struct ChunkScheduler<B: ComputeBackend, O: AudioOutput> {
    program: KernelProgram,
    config: EngineConfig,

    /// Absent between a reconfiguration and the rebuild it triggers.
    binding: Option<KernelBinding<B>>,

    dispatcher: Dispatcher<B>,
    sink: PlaybackSinkAdapter<O>,
    params: ParameterChannel<B>,
    timeline: Timeline,

    /// Issued chunks in start-time order.
    pending: VecDeque<PendingChunk>,

    status: Arc<SharedStatus>,
    control: mpsc::UnboundedReceiver<ControlMessage>,
    stop: watch::Receiver<bool>,

    chunks_produced: u64,
    played_until: f64,
    deferrals: u64,
    rebuilds: u32,
}

impl<B: ComputeBackend, O: AudioOutput> ChunkScheduler<B, O> {
    pub fn new(parts: SchedulerParts<B, O>) -> Self {
        let layout = parts.config.layout();
        let depth = parts.binding.depth();

        Self {
            timeline: Timeline::new(
                Instant::now(),
                layout.duration(),
                parts.config.max_buffered_chunks,
            ),
            program: parts.program,
            config: parts.config,
            binding: Some(parts.binding),
            dispatcher: Dispatcher::new(parts.backend),
            sink: parts.sink,
            params: parts.params,
            pending: VecDeque::with_capacity(depth),
            status: parts.status,
            control: parts.control,
            stop: parts.stop,
            chunks_produced: 0,
            played_until: 0.0,
            deferrals: 0,
            rebuilds: 0,
        }
    }

    /// Run until stopped or faulted, then release device resources.
    pub async fn run(mut self) -> SchedulerExit<O> {
        let mut fault = self.produce().await.err();

        if let Some(err) = &fault {
            error!("Engine run failed: {}", err);
            self.status.set_faulted();
        }

        // In-flight mappings always resolve before buffers are released
        let drained = self.drain(fault.is_none()).await;
        if fault.is_none() {
            fault = drained;
        }

        self.params.detach();
        self.binding = None;
        self.sink.reclaim();

        info!(
            "Engine stopped after {} chunk(s) ({:.3}s, {} deferral(s), {} output buffer(s) released)",
            self.chunks_produced,
            self.played_until,
            self.deferrals,
            self.sink.released()
        );

        SchedulerExit {
            report: RunReport {
                chunks_produced: self.chunks_produced,
                final_offset: self.played_until,
                deferrals: self.deferrals,
                rebuilds: self.rebuilds,
                fault,
            },
            sink: self.sink,
        }
    }

    fn stop_requested(&self) -> bool {
        // A dropped engine handle counts as a stop
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    fn depth(&self) -> usize {
        self.binding
            .as_ref()
            .map_or(self.config.pipeline_depth, |binding| binding.depth())
    }

    async fn produce(&mut self) -> Result<(), EngineError> {
        self.sink.begin_run()?;
        self.timeline.reset(Instant::now());
        self.status.begin_run();
        self.status
            .transition(EngineState::Starting, EngineState::Running);

        info!(
            "Engine running: {}Hz, {:.3}s chunks, {} buffered max, depth {}",
            self.config.sample_rate,
            self.timeline.duration(),
            self.config.max_buffered_chunks,
            self.depth()
        );

        loop {
            while let Ok(message) = self.control.try_recv() {
                self.handle_control(message).await?;
            }
            if self.stop_requested() {
                return Ok(());
            }

            let now = Instant::now();
            match self.timeline.evaluate(now) {
                Decision::Dispatch { offset } => {
                    self.status
                        .record_buffered(self.timeline.buffered_seconds(now));
                    if self.pending.len() >= self.depth() {
                        self.deliver_next().await?;
                        continue;
                    }
                    self.try_produce_next(offset).await?;
                }

                Decision::Defer {
                    retry_after,
                    buffered,
                } => {
                    self.status.record_buffered(buffered);

                    // Finish in-flight chunks before going to sleep
                    if !self.pending.is_empty() {
                        self.deliver_next().await?;
                        continue;
                    }

                    self.deferrals += 1;
                    self.status.record_deferral();
                    trace!(
                        "Deferring chunk at {:.3}s: {:.3}s buffered, retry in {:?}",
                        self.timeline.next_chunk_offset(),
                        buffered,
                        retry_after
                    );

                    let message = tokio::select! {
                        _ = tokio::time::sleep(retry_after) => None,
                        _ = self.stop.changed() => None,
                        Some(message) = self.control.recv() => Some(message),
                    };
                    if let Some(message) = message {
                        self.handle_control(message).await?;
                    }
                }
            }
        }
    }

    /// Dispatch the chunk starting at `offset`.
    async fn try_produce_next(&mut self, offset: f64) -> Result<(), EngineError> {
        match self.dispatcher.issue(self.binding.as_mut(), offset) {
            Ok(pending) => {
                self.timeline.advance(self.config.layout().duration());
                self.pending.push_back(pending);
                if self.pending.len() >= self.depth() {
                    self.deliver_next().await?;
                }
                Ok(())
            }
            Err(DispatchError::BufferNotReady) => {
                warn!(
                    "Device buffers not ready for chunk at {:.3}s, rebuilding",
                    offset
                );
                self.rebuild()
            }
            Err(DispatchError::ReadbackBusy(slot)) if !self.pending.is_empty() => {
                debug!("Read-back slot {} busy, resolving oldest chunk", slot);
                self.deliver_next().await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn deliver_next(&mut self) -> Result<(), EngineError> {
        let Some(pending) = self.pending.pop_front() else {
            return Ok(());
        };
        let chunk = pending.resolve().await?;
        self.deliver(chunk)
    }

    fn deliver(&mut self, chunk: SampleChunk) -> Result<(), EngineError> {
        let start = chunk.start_time;
        let frames = chunk.frames();
        let peaks = chunk.peaks();

        let duration = self.sink.submit(chunk)?;
        debug_assert!(start >= self.played_until, "chunks delivered out of order");

        self.chunks_produced += 1;
        self.played_until = start + duration;
        self.status
            .record_chunk(self.timeline.next_chunk_offset(), peaks);

        debug!(
            "Scheduled chunk {} at {:.3}s ({} frames)",
            self.chunks_produced, start, frames
        );
        Ok(())
    }

    /// Resolve every in-flight chunk. Chunks are handed to the output only
    /// when `deliver` is set and nothing has failed yet.
    async fn drain(&mut self, deliver: bool) -> Option<EngineError> {
        let mut fault = None;
        while let Some(pending) = self.pending.pop_front() {
            let result = match pending.resolve().await {
                Ok(chunk) if deliver && fault.is_none() => self.deliver(chunk),
                Ok(_) => Ok(()),
                Err(err) => Err(err.into()),
            };
            if let (Err(err), None) = (result, &fault) {
                fault = Some(err);
            }
        }
        fault
    }

    async fn handle_control(&mut self, message: ControlMessage) -> Result<(), EngineError> {
        match message {
            ControlMessage::Reconfigure(config) => {
                let rebuild = self.config.requires_rebuild(&config);
                if rebuild {
                    info!(
                        "Reconfiguring: {} -> {} frames per chunk, rebuilding device buffers",
                        self.config.layout().frames,
                        config.layout().frames
                    );

                    // Old-size chunks already in flight still play
                    while !self.pending.is_empty() {
                        self.deliver_next().await?;
                    }
                    self.params.detach();
                    self.binding = None;
                    self.rebuilds += 1;
                } else {
                    info!(
                        "Reconfiguring: max buffered chunks {} -> {}",
                        self.config.max_buffered_chunks, config.max_buffered_chunks
                    );
                }

                self.config = config;
                self.timeline
                    .reconfigure(config.layout().duration(), config.max_buffered_chunks);
                Ok(())
            }
        }
    }

    fn rebuild(&mut self) -> Result<(), EngineError> {
        let binding = KernelBinding::build(
            self.dispatcher.backend().as_ref(),
            &self.program,
            self.config.layout(),
            self.config.pipeline_depth,
        )?;
        self.params.attach(binding.params().cloned())?;
        self.binding = Some(binding);
        Ok(())
    }
}
