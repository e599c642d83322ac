// src/engine.rs

use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::ComputeBackend;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, SinkError};
use crate::kernel::{KernelBinding, KernelProgram};
use crate::params::ParameterChannel;
use crate::scheduler::{ChunkScheduler, ControlMessage, RunReport, SchedulerExit, SchedulerParts};
use crate::sink::{AudioOutput, PlaybackSinkAdapter};
use crate::status::{EngineState, EngineStatus, SharedStatus};

/// Handles to one spawned scheduler task.
struct ActiveRun<O: AudioOutput> {
    task: JoinHandle<()>,

    /// Filled by the task just before it reports Stopped.
    exit: Arc<Mutex<Option<SchedulerExit<O>>>>,

    stop: watch::Sender<bool>,
    control: mpsc::UnboundedSender<ControlMessage>,
}

/// Chunked synthesis engine.
///
/// Owns the compute backend, the kernel program and the audio output, and
/// runs one scheduler task per play/stop cycle on the tokio runtime it was
/// created on. There is no global instance; create one with
/// [`init`](Self::init) and tear it down with [`shutdown`](Self::shutdown).
pub struct Engine<B: ComputeBackend, O: AudioOutput> {
    backend: Arc<B>,
    program: KernelProgram,
    config: EngineConfig,
    runtime: Handle,
    params: ParameterChannel<B>,
    status: Arc<SharedStatus>,

    /// The output while no run owns it.
    sink: Option<PlaybackSinkAdapter<O>>,

    /// Fixed queue size of the output, checked against every config.
    output_capacity: Option<usize>,

    run: Option<ActiveRun<O>>,
}

impl<B: ComputeBackend, O: AudioOutput> Engine<B, O> {
    /// Create a stopped engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(
        backend: Arc<B>,
        program: KernelProgram,
        output: O,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        if output.channels() != config.num_channels {
            return Err(SinkError::ChannelMismatch {
                expected: output.channels(),
                got: config.num_channels,
            }
            .into());
        }

        let output_capacity = output.queue_capacity();
        check_output_capacity(&config, output_capacity)?;

        info!(
            "Engine initialized: kernel '{}' on {}",
            program.label,
            backend.name()
        );

        Ok(Self {
            params: ParameterChannel::new(Arc::clone(&backend), program.param_count),
            backend,
            program,
            config,
            runtime,
            status: Arc::new(SharedStatus::default()),
            sink: Some(PlaybackSinkAdapter::new(output)),
            output_capacity,
            run: None,
        })
    }

    /// Start producing audio.
    ///
    /// Device buffers are built before this returns, so device and kernel
    /// errors surface here and leave the engine stopped. A no-op while a
    /// run is active.
    pub fn play(&mut self) -> EngineResult<()> {
        self.reap();

        if !self
            .status
            .transition(EngineState::Stopped, EngineState::Starting)
        {
            debug!("play() ignored, engine is {:?}", self.status.state());
            return Ok(());
        }

        info!("Engine starting");
        self.start().inspect_err(|err| {
            error!("Engine failed to start: {}", err);
            self.status.set_state(EngineState::Stopped);
        })
    }

    fn start(&mut self) -> EngineResult<()> {
        let layout = self.config.layout();
        let binding = KernelBinding::build(
            self.backend.as_ref(),
            &self.program,
            layout,
            self.config.pipeline_depth,
        )?;
        self.params.attach(binding.params().cloned())?;

        let Some(sink) = self.sink.take() else {
            self.params.detach();
            return Err(EngineError::TaskFailed("audio output was lost".into()));
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let scheduler = ChunkScheduler::new(SchedulerParts {
            backend: Arc::clone(&self.backend),
            program: self.program.clone(),
            config: self.config,
            binding,
            sink,
            params: self.params.clone(),
            status: Arc::clone(&self.status),
            control: control_rx,
            stop: stop_rx,
        });

        let exit = Arc::new(Mutex::new(None));
        let exit_slot = Arc::clone(&exit);
        let status = Arc::clone(&self.status);

        let task = self.runtime.spawn(async move {
            let result = scheduler.run().await;
            *exit_slot.lock() = Some(result);
            status.set_state(EngineState::Stopped);
        });

        self.run = Some(ActiveRun {
            task,
            exit,
            stop: stop_tx,
            control: control_tx,
        });
        Ok(())
    }

    /// Take back the output from a run whose task has ended.
    ///
    /// The task fills its exit slot before it reports Stopped, so a filled
    /// slot alone does not mean the task is done.
    fn reap(&mut self) {
        if !self.run.as_ref().is_some_and(|run| run.task.is_finished()) {
            return;
        }
        let Some(run) = self.run.take() else {
            return;
        };

        match run.exit.lock().take() {
            Some(exit) => {
                if let Some(fault) = &exit.report.fault {
                    warn!("Discarding report of faulted run: {}", fault);
                }
                self.sink = Some(exit.sink);
            }
            None => {
                error!("Scheduler task ended without returning the audio output");
                self.status.set_faulted();
                self.status.set_state(EngineState::Stopped);
            }
        }
    }

    /// Stop producing audio and release device buffers.
    ///
    /// Cancels any pending retry, lets in-flight mappings resolve, and
    /// returns the report of the run. Returns `None` when there is no run
    /// to stop, so calling it twice is harmless.
    ///
    /// Cancel safe: if the returned future is dropped the run stays owned by
    /// the engine, and a later `stop()` or `play()` picks it up.
    pub async fn stop(&mut self) -> Option<RunReport> {
        let run = self.run.as_mut()?;

        if self
            .status
            .transition(EngineState::Running, EngineState::Draining)
            || self
                .status
                .transition(EngineState::Starting, EngineState::Draining)
        {
            info!("Engine draining");
        }
        let _ = run.stop.send(true);

        let joined = (&mut run.task).await;
        let run = self.run.take()?;

        if let Err(err) = joined {
            error!("Scheduler task failed: {}", err);
            self.status.set_faulted();
            self.status.set_state(EngineState::Stopped);
            return Some(RunReport {
                chunks_produced: 0,
                final_offset: 0.0,
                deferrals: 0,
                rebuilds: 0,
                fault: Some(EngineError::TaskFailed(err.to_string())),
            });
        }

        let exit = run.exit.lock().take();
        exit.map(|exit| {
            self.sink = Some(exit.sink);
            exit.report
        })
    }

    /// Apply a new configuration.
    ///
    /// Takes effect on the next play when stopped. While running, device
    /// buffers are rebuilt (if the chunk size changed) before the next
    /// dispatch.
    pub fn reconfigure(&mut self, config: EngineConfig) -> EngineResult<()> {
        config.validate()?;
        check_output_capacity(&config, self.output_capacity)?;
        self.config = config;

        if let Some(run) = &self.run {
            if run.control.send(ControlMessage::Reconfigure(config)).is_err() {
                debug!("Run already ended, new configuration applies on next play");
            }
        }
        Ok(())
    }

    /// Handle for writing kernel parameters.
    pub fn parameters(&self) -> ParameterChannel<B> {
        self.params.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.snapshot()
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        self.status.state()
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Stop if running, close the output and drop the engine.
    pub async fn shutdown(mut self) -> EngineResult<Option<RunReport>> {
        let report = self.stop().await;
        self.reap();
        if let Some(sink) = self.sink.as_mut() {
            sink.close()?;
        }
        info!("Engine shut down");
        Ok(report)
    }
}

fn check_output_capacity(config: &EngineConfig, capacity: Option<usize>) -> EngineResult<()> {
    let needed = config.output_queue_depth();
    match capacity {
        Some(capacity) if capacity < needed => {
            Err(SinkError::QueueCapacity { needed, capacity }.into())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::backend::probe::ProbeBackend;
    use crate::error::{BackendError, ConfigError, DispatchError};
    use crate::sink::{MemoryHandle, MemoryOutput};

    /// Left = timeline time of the frame, right = first parameter.
    fn clock_program() -> KernelProgram {
        KernelProgram::native("clock", |ctx, out| {
            for (i, frame) in out.chunks_exact_mut(2).enumerate() {
                frame[0] = ctx.time_at(i) as f32;
                frame[1] = ctx.params.first().copied().unwrap_or(0.0);
            }
        })
        .with_params(1)
    }

    fn config(sample_rate: f64, chunk: f64, max_buffered: u32) -> EngineConfig {
        EngineConfig {
            sample_rate,
            chunk_duration_seconds: chunk,
            workgroup_size: 4,
            max_buffered_chunks: max_buffered,
            ..Default::default()
        }
    }

    fn engine(
        backend: &Arc<ProbeBackend>,
        config: EngineConfig,
    ) -> (Engine<ProbeBackend, MemoryOutput>, MemoryHandle) {
        let output = MemoryOutput::new(2);
        let handle = output.handle();
        let engine = Engine::init(Arc::clone(backend), clock_program(), output, config).unwrap();
        (engine, handle)
    }

    fn assert_contiguous(handle: &MemoryHandle, sample_rate: f64) {
        let scheduled = handle.scheduled();
        for pair in scheduled.windows(2) {
            let duration = pair[0].buffer.frames as f64 / sample_rate;
            let gap = pair[0].start_time + duration - pair[1].start_time;
            assert!(gap.abs() < 1e-9, "gap of {gap}s between chunks");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_second_chunks_at_44100() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, handle) = engine(&backend, EngineConfig::default());

        let start = Instant::now();
        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let report = engine.stop().await.unwrap();

        let dispatches = backend.dispatches();
        assert_eq!(dispatches.len(), 3);

        // Chunks 0 and 1 go out immediately
        assert_eq!(dispatches[0].time_offset, 0.0);
        assert_eq!(dispatches[0].at, start);
        assert_eq!(dispatches[1].time_offset, 1.0);
        assert_eq!(dispatches[1].at, start);

        // Chunk 2 waits until the wall clock is within one chunk of t=2
        assert_eq!(dispatches[2].time_offset, 2.0);
        let waited = dispatches[2].at - start;
        assert!(waited >= Duration::from_secs(1));
        assert!((waited.as_secs_f64() - 1.8).abs() < 0.01);

        assert_eq!(handle.start_times(), vec![0.0, 1.0, 2.0]);
        assert_eq!(handle.scheduled()[0].buffer.frames, 44_100);
        assert_eq!(report.chunks_produced, 3);
        assert!(report.deferrals >= 2);
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_are_contiguous_and_ordered() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 2));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let report = engine.stop().await.unwrap();

        assert!(report.chunks_produced >= 25);
        assert_eq!(handle.len() as u64, report.chunks_produced);
        assert_eq!(handle.start_times()[0], 0.0);
        assert_contiguous(&handle, 100.0);

        // Each chunk carries the samples for its own start time
        for scheduled in handle.scheduled() {
            let first = scheduled.buffer.channel(0)[0];
            assert!((first as f64 - scheduled.start_time).abs() < 1e-4);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_bound_holds() {
        let backend = Arc::new(ProbeBackend::new());
        let config = config(1000.0, 0.05, 2);
        let duration = config.layout().duration();
        let (mut engine, _handle) = engine(&backend, config);

        let start = Instant::now();
        engine.play().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let report = engine.stop().await.unwrap();

        let dispatches = backend.dispatches();
        assert!(dispatches.len() > 10);
        for record in &dispatches {
            let elapsed = (record.at - start).as_secs_f64();
            let buffered = record.time_offset + duration - elapsed;
            assert!(
                buffered / duration <= 2.0 + 1.0 + 1e-3,
                "{:.3} chunks buffered at {:.3}s",
                buffered / duration,
                elapsed
            );
        }
        assert!(report.deferrals > 0);
        assert!(engine.status().deferrals > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_at_depth_one() {
        let backend = Arc::new(ProbeBackend::gated());
        let (mut engine, _handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        // The first mapping is held, so nothing else may be dispatched
        assert_eq!(backend.dispatches().len(), 1);
        assert_eq!(backend.outstanding_maps(), 1);

        backend.release_maps(1000);
        tokio::time::sleep(Duration::from_secs(2)).await;
        engine.stop().await.unwrap();

        let dispatches = backend.dispatches();
        assert!(dispatches.len() > 10);
        assert!(dispatches.iter().all(|d| d.outstanding_maps == 0));
        assert_eq!(backend.max_outstanding_maps(), 1);
        assert!(backend.violations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_buffered_keeps_order() {
        let backend = Arc::new(ProbeBackend::new());
        let config = EngineConfig {
            pipeline_depth: 2,
            ..config(100.0, 0.1, 2)
        };
        let (mut engine, handle) = engine(&backend, config);

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let report = engine.stop().await.unwrap();

        assert!(report.is_clean());
        assert_eq!(backend.max_outstanding_maps(), 2);
        assert!(backend.dispatches().iter().any(|d| d.outstanding_maps == 1));
        assert!(backend.violations().is_empty());
        assert_eq!(handle.start_times()[0], 0.0);
        assert_contiguous(&handle, 100.0);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, _handle) = engine(&backend, config(100.0, 0.1, 1));

        assert!(engine.stop().await.is_none());

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.state(), EngineState::Running);

        assert!(engine.stop().await.is_some());
        assert!(engine.stop().await.is_none());
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(backend.live_buffers(), 0);

        // No timer left behind: nothing is dispatched after stop
        let dispatched = backend.dispatches().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.dispatches().len(), dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_chunk_resolves() {
        let backend = Arc::new(ProbeBackend::gated());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(backend.dispatches().len(), 1);
        assert_eq!(backend.outstanding_maps(), 1);

        let (report, _) = tokio::join!(engine.stop(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            // Buffers stay alive while the mapping is outstanding
            assert_eq!(backend.violations(), Vec::<String>::new());
            backend.release_maps(1);
        });

        let report = report.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.chunks_produced, 1);
        assert_eq!(handle.len(), 1);
        assert_eq!(backend.dispatches().len(), 1);
        assert_eq!(backend.live_buffers(), 0);
        assert!(backend.violations().is_empty());
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.stop().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_stop_keeps_run() {
        let backend = Arc::new(ProbeBackend::gated());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        // Give up on stop() while the first mapping is still held
        let timed_out = tokio::time::timeout(Duration::from_millis(5), engine.stop()).await;
        assert!(timed_out.is_err());
        assert_eq!(engine.state(), EngineState::Draining);

        backend.release_maps(1000);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(backend.live_buffers(), 0);

        // The output comes back with the finished run
        engine.play().unwrap();
        assert_eq!(engine.state(), EngineState::Starting);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let report = engine.stop().await.unwrap();
        assert!(report.is_clean());
        assert!(report.chunks_produced > 0);
        assert_eq!(handle.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_stop_finishes_cancelled_one() {
        let backend = Arc::new(ProbeBackend::gated());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(5), engine.stop())
                .await
                .is_err()
        );

        let (report, _) = tokio::join!(engine.stop(), async {
            backend.release_maps(1);
        });
        let report = report.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.chunks_produced, 1);
        assert_eq!(handle.len(), 1);
        assert!(engine.stop().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_waits_for_finishing_task() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        // A faulted run that has filled its exit slot but not yet
        // reported Stopped
        let sink = engine.sink.take().unwrap();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();
        let status = Arc::clone(&engine.status);
        status.set_state(EngineState::Running);
        let task = tokio::spawn(async move {
            let _ = finish_rx.await;
            status.set_state(EngineState::Stopped);
        });
        let (stop, _stop_rx) = watch::channel(false);
        let (control, _control_rx) = mpsc::unbounded_channel();
        engine.run = Some(ActiveRun {
            task,
            exit: Arc::new(Mutex::new(Some(SchedulerExit {
                sink,
                report: RunReport {
                    chunks_produced: 0,
                    final_offset: 0.0,
                    deferrals: 0,
                    rebuilds: 0,
                    fault: Some(EngineError::TaskFailed("mapping lost".into())),
                },
            }))),
            stop,
            control,
        });

        engine.play().unwrap();
        assert!(engine.run.is_some());
        assert!(engine.sink.is_none());
        assert!(backend.dispatches().is_empty());

        finish_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let report = engine.stop().await.unwrap();
        assert!(report.is_clean());
        assert!(report.chunks_produced > 0);
        assert_eq!(handle.runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_rebuilds_buffers() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = handle.len();

        engine.reconfigure(config(100.0, 0.2, 1)).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let report = engine.stop().await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.rebuilds, 1);

        let frames: Vec<usize> = handle.scheduled().iter().map(|s| s.buffer.frames).collect();
        assert!(frames[..before].iter().all(|&f| f == 10));
        assert!(frames.len() > before);

        // Once the new size appears, the old size never comes back
        let switch = frames.iter().position(|&f| f == 20).unwrap();
        assert!(frames[switch..].iter().all(|&f| f == 20));
        assert_contiguous(&handle, 100.0);
        assert!(backend.violations().is_empty());
        assert_eq!(backend.live_buffers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_while_stopped_applies_on_play() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.reconfigure(config(100.0, 0.25, 1)).unwrap();
        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await.unwrap();

        assert_eq!(handle.scheduled()[0].buffer.frames, 25);
        assert!(matches!(
            engine.reconfigure(config(0.0, 0.1, 1)),
            Err(EngineError::Config(ConfigError::SampleRate(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_must_fit_output_queue() {
        let backend = Arc::new(ProbeBackend::new());

        // 8 buffered + 1 in flight + 2 slack
        let output = MemoryOutput::new(2).with_queue_capacity(4);
        let result = Engine::init(
            Arc::clone(&backend),
            clock_program(),
            output,
            config(100.0, 0.1, 8),
        );
        assert!(matches!(
            result,
            Err(EngineError::Sink(SinkError::QueueCapacity {
                needed: 11,
                capacity: 4
            }))
        ));

        let output = MemoryOutput::new(2).with_queue_capacity(4);
        let mut engine = Engine::init(
            Arc::clone(&backend),
            clock_program(),
            output,
            config(100.0, 0.1, 1),
        )
        .unwrap();
        assert!(matches!(
            engine.reconfigure(config(100.0, 0.1, 2)),
            Err(EngineError::Sink(SinkError::QueueCapacity {
                needed: 5,
                capacity: 4
            }))
        ));
        assert_eq!(engine.config().max_buffered_chunks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mapping_failure_stops_run() {
        let backend = Arc::new(ProbeBackend::new());
        backend.fail_map_number(2);
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let status = engine.status();
        assert_eq!(status.state, EngineState::Stopped);
        assert!(status.faulted);
        assert_eq!(backend.dispatches().len(), 3);

        let report = engine.stop().await.unwrap();
        assert!(matches!(
            report.fault,
            Some(EngineError::Dispatch(DispatchError::Backend(
                BackendError::Mapping(_)
            )))
        ));
        assert!(report.fault.as_ref().is_some_and(|err| err.is_fatal()));
        // The failed chunk never reaches the output
        assert_eq!(report.chunks_produced, 2);
        assert_eq!(handle.len(), 2);
        assert_eq!(backend.live_buffers(), 0);
        assert!(engine.stop().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_after_fault_starts_fresh_run() {
        let backend = Arc::new(ProbeBackend::new());
        backend.fail_map_number(0);
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let report = engine.stop().await.unwrap();

        assert!(report.is_clean());
        assert!(report.chunks_produced > 0);
        assert_eq!(handle.runs(), 2);
        assert_eq!(handle.start_times()[0], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_unavailable_keeps_engine_stopped() {
        let backend = Arc::new(ProbeBackend::unavailable());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        let result = engine.play();
        assert!(matches!(
            result,
            Err(EngineError::Backend(BackendError::DeviceUnavailable(_)))
        ));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.stop().await.is_none());
        assert_eq!(backend.live_buffers(), 0);
        assert!(handle.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parameters_survive_rebuild() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));
        let params = engine.parameters();

        // Set before any buffer exists
        params.set_parameters(&[0.5]).unwrap();
        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handle.scheduled()[0].buffer.channel(1).iter().all(|&v| v == 0.5));

        params.set_parameters(&[0.75]).unwrap();
        engine.reconfigure(config(100.0, 0.2, 1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.stop().await.unwrap();

        let last = handle.scheduled().pop().unwrap();
        assert_eq!(last.buffer.frames, 20);
        assert!(last.buffer.channel(1).iter().all(|&v| v == 0.75));
        assert_eq!(params.values(), vec![0.75]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_twice_is_noop_and_restart_rewinds() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = engine.status();
        assert_eq!(status.state, EngineState::Running);
        assert!(status.chunks_produced > 0);
        assert!(status.next_chunk_offset > 0.0);
        engine.stop().await.unwrap();

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        engine.stop().await.unwrap();

        assert_eq!(handle.runs(), 2);
        let second_run: Vec<f64> = handle
            .scheduled()
            .iter()
            .filter(|s| s.run == 1)
            .map(|s| s.start_time)
            .collect();
        assert_eq!(second_run[0], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_output() {
        let backend = Arc::new(ProbeBackend::new());
        let (mut engine, handle) = engine(&backend, config(100.0, 0.1, 1));

        engine.play().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let report = engine.shutdown().await.unwrap();

        assert!(report.is_some());
        assert!(handle.is_closed());
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_init_requires_runtime() {
        let backend = Arc::new(ProbeBackend::new());
        let result = Engine::init(
            backend,
            clock_program(),
            MemoryOutput::new(2),
            EngineConfig::default(),
        );
        assert!(matches!(result, Err(EngineError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_init_rejects_bad_config() {
        let backend = Arc::new(ProbeBackend::new());
        let bad = EngineConfig {
            num_channels: 1,
            ..Default::default()
        };
        let result = Engine::init(backend, clock_program(), MemoryOutput::new(2), bad);
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::Channels(1)))
        ));
    }
}
