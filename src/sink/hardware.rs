// src/sink/hardware.rs
//
// Real-time output through cpal.
//
// The stream lives on its own thread (cpal streams are not `Send` on every
// host). Scheduled buffers cross into the audio callback through an rtrb
// ring; finished buffers come back through a second ring so they are
// deallocated off the audio thread.
//
//   engine task ──Cue──► [rtrb] ──► audio callback ──done──► [rtrb] ──► reclaim()

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info, warn};

use super::AudioOutput;
use crate::audio_buffer::PlanarBuffer;
use crate::error::SinkError;

enum Cue {
    /// Start a new run at the current device frame.
    Rebase,
    Play { start_frame: u64, buffer: PlanarBuffer },
}

struct Playing {
    start_frame: u64,
    buffer: PlanarBuffer,

    /// At least one frame reached the device.
    played: bool,
}

/// State owned by the audio callback.
struct CallbackState {
    cues: rtrb::Consumer<Cue>,
    finished: rtrb::Producer<PlanarBuffer>,

    /// Never grows past its initial capacity.
    active: Vec<Playing>,

    /// Frames rendered since the stream started.
    clock: u64,

    /// Device frame of run offset zero; set by the first buffer of a run.
    anchor: Option<u64>,

    /// Buffers retired without a single frame played.
    dropped: Arc<AtomicU64>,
}

impl CallbackState {
    fn new(
        cues: rtrb::Consumer<Cue>,
        finished: rtrb::Producer<PlanarBuffer>,
        queue_depth: usize,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            cues,
            finished,
            active: Vec::with_capacity(queue_depth),
            clock: 0,
            anchor: None,
            dropped,
        }
    }

    fn admit_cues(&mut self) {
        loop {
            // A buffer that does not fit yet stays queued
            match self.cues.peek() {
                Ok(Cue::Play { .. }) if self.active.len() == self.active.capacity() => return,
                Ok(_) => {}
                Err(_) => return,
            }
            let Ok(cue) = self.cues.pop() else {
                return;
            };

            match cue {
                Cue::Rebase => self.anchor = None,
                Cue::Play {
                    start_frame,
                    buffer,
                } => {
                    let anchor = *self.anchor.get_or_insert(self.clock);
                    self.active.push(Playing {
                        start_frame: anchor + start_frame,
                        buffer,
                        played: false,
                    });
                }
            }
        }
    }

    fn render(&mut self, data: &mut [f32], channels: usize) {
        self.admit_cues();

        let frames = data.len() / channels;
        for (i, frame) in data.chunks_exact_mut(channels).enumerate() {
            let now = self.clock + i as u64;
            frame.fill(0.0);
            for playing in &mut self.active {
                if now < playing.start_frame {
                    continue;
                }
                let offset = (now - playing.start_frame) as usize;
                if offset >= playing.buffer.frames {
                    continue;
                }
                playing.played = true;
                for (ch, sample) in frame.iter_mut().enumerate() {
                    *sample += playing.buffer.sample_or_silence(ch, offset);
                }
            }
        }
        self.clock += frames as u64;

        let mut i = 0;
        while i < self.active.len() {
            let playing = &self.active[i];
            let end = playing.start_frame + playing.buffer.frames as u64;
            if end <= self.clock && !self.finished.is_full() {
                let done = self.active.swap_remove(i);
                if !done.played {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                let _ = self.finished.push(done.buffer);
            } else {
                i += 1;
            }
        }
    }
}

/// Plays scheduled buffers on the default output device.
///
/// Holds up to `queue_depth` buffers queued or playing; open it with
/// [`EngineConfig::output_queue_depth`](crate::EngineConfig::output_queue_depth).
pub struct HardwareOutput {
    cues: rtrb::Producer<Cue>,
    finished: rtrb::Consumer<PlanarBuffer>,
    channels: usize,
    sample_rate: f64,
    queue_depth: usize,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    dropped_reported: u64,
}

impl HardwareOutput {
    /// Open the default output device at `sample_rate` with `channels`.
    pub fn open(sample_rate: f64, channels: usize, queue_depth: usize) -> Result<Self, SinkError> {
        let queue_depth = queue_depth.max(1);

        // One extra cue slot for the Rebase that opens each run
        let (cue_tx, cue_rx) = rtrb::RingBuffer::new(queue_depth + 1);
        let (done_tx, done_rx) = rtrb::RingBuffer::new(queue_depth);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), SinkError>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let failed = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let state = CallbackState::new(cue_rx, done_tx, queue_depth, Arc::clone(&dropped));
        let stream_failed = Arc::clone(&failed);

        let thread = thread::Builder::new()
            .name("gpusynth-output".into())
            .spawn(move || {
                let stream = match build_stream(sample_rate, channels, state, stream_failed) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until closed
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|err| SinkError::Device(err.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(SinkError::Device("output thread exited".into()));
            }
        }

        Ok(Self {
            cues: cue_tx,
            finished: done_rx,
            channels,
            sample_rate,
            queue_depth,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
            failed,
            dropped,
            dropped_reported: 0,
        })
    }

    /// Buffers that finished without any of their frames being played.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&mut self, cue: Cue) -> Result<(), SinkError> {
        if self.shutdown.is_none() {
            return Err(SinkError::Closed);
        }
        if self.failed.load(Ordering::Relaxed) {
            return Err(SinkError::Device("output stream failed".into()));
        }
        self.cues
            .push(cue)
            .map_err(|_| SinkError::Device("output queue is full".into()))
    }
}

fn build_stream(
    sample_rate: f64,
    channels: usize,
    mut state: CallbackState,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, SinkError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SinkError::Device("no default output device".into()))?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!(
        "Using audio device: {} ({} channels, {}Hz)",
        device_name, channels, sample_rate
    );

    let config = cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(sample_rate.round() as u32),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                state.render(data, channels);
            },
            move |err| {
                error!("Audio output stream error: {}", err);
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|err| SinkError::Device(err.to_string()))?;

    stream
        .play()
        .map_err(|err| SinkError::Device(err.to_string()))?;
    Ok(stream)
}

impl AudioOutput for HardwareOutput {
    fn channels(&self) -> usize {
        self.channels
    }

    fn queue_capacity(&self) -> Option<usize> {
        Some(self.queue_depth)
    }

    fn begin_run(&mut self) -> Result<(), SinkError> {
        self.push(Cue::Rebase)
    }

    fn schedule(&mut self, start_time: f64, buffer: PlanarBuffer) -> Result<(), SinkError> {
        let start_frame = (start_time * self.sample_rate).round() as u64;
        self.push(Cue::Play {
            start_frame,
            buffer,
        })
    }

    fn reclaim(&mut self) -> usize {
        let mut released = 0;
        while let Ok(buffer) = self.finished.pop() {
            drop(buffer);
            released += 1;
        }

        let dropped = self.dropped();
        if dropped > self.dropped_reported {
            warn!(
                "{} scheduled buffer(s) arrived too late to play",
                dropped - self.dropped_reported
            );
            self.dropped_reported = dropped;
        }
        released
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio output thread panicked");
            }
        }
        self.reclaim();
        Ok(())
    }
}

impl Drop for HardwareOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
