// src/main.rs
//
// Demo: plays a stereo sine through the engine for a few seconds.
//
//   gpusynth-engine [config.json] [seconds] [out.wav]
//
// Pass "-" as the config path to use the defaults.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use gpusynth::{Engine, EngineConfig, KernelProgram};

#[cfg(feature = "gpu")]
use gpusynth::backend::WgpuBackend as Backend;
#[cfg(not(feature = "gpu"))]
use gpusynth::backend::CpuBackend as Backend;

#[cfg(feature = "playback")]
use gpusynth::sink::HardwareOutput as Output;
#[cfg(not(feature = "playback"))]
use gpusynth::sink::WavOutput as Output;

const DEFAULT_SECONDS: u64 = 5;
const DEFAULT_WAV_PATH: &str = "gpusynth.wav";

/// [frequency Hz, gain, stereo detune Hz]
const BASE_PARAMS: [f32; 3] = [220.0, 0.2, 1.5];

#[cfg(feature = "gpu")]
async fn backend() -> Result<Backend> {
    Ok(Backend::new().await?)
}

#[cfg(not(feature = "gpu"))]
async fn backend() -> Result<Backend> {
    Ok(Backend::new())
}

#[cfg(feature = "gpu")]
fn program() -> KernelProgram {
    KernelProgram::wgsl(
        "stereo sine",
        include_str!("kernels/stereo_sine.wgsl"),
        "synthesize",
    )
    .with_params(BASE_PARAMS.len())
}

#[cfg(not(feature = "gpu"))]
fn program() -> KernelProgram {
    use std::f64::consts::TAU;

    KernelProgram::native("stereo sine", |ctx, out| {
        let freq = ctx.params.first().copied().unwrap_or(BASE_PARAMS[0]) as f64;
        let gain = ctx.params.get(1).copied().unwrap_or(BASE_PARAMS[1]);
        let detune = ctx.params.get(2).copied().unwrap_or(BASE_PARAMS[2]) as f64;

        for (i, frame) in out.chunks_exact_mut(2).enumerate() {
            let t = ctx.time_at(i);
            frame[0] = (TAU * freq * t).sin() as f32 * gain;
            frame[1] = (TAU * (freq + detune) * t).sin() as f32 * gain;
        }
    })
    .with_params(BASE_PARAMS.len())
}

#[cfg(feature = "playback")]
fn output(config: &EngineConfig, _wav_path: &str) -> Result<Output> {
    Ok(Output::open(
        config.sample_rate,
        config.num_channels,
        config.output_queue_depth(),
    )?)
}

#[cfg(not(feature = "playback"))]
fn output(config: &EngineConfig, wav_path: &str) -> Result<Output> {
    Output::create(wav_path, config.sample_rate, config.num_channels)
        .with_context(|| format!("failed to create {wav_path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) if path != "-" => {
            EngineConfig::load(&path).with_context(|| format!("failed to load {path}"))?
        }
        _ => EngineConfig::default(),
    };
    let seconds = match args.next() {
        Some(arg) => arg
            .parse::<u64>()
            .with_context(|| format!("invalid duration '{arg}'"))?,
        None => DEFAULT_SECONDS,
    };
    let wav_path = args.next().unwrap_or_else(|| DEFAULT_WAV_PATH.to_string());

    let backend = Arc::new(backend().await?);
    let output = output(&config, &wav_path)?;
    let mut engine = Engine::init(backend, program(), output, config)?;

    let params = engine.parameters();
    params.set_parameters(&BASE_PARAMS)?;
    engine.play()?;

    // Step up a semitone every second
    for second in 1..=seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let freq = BASE_PARAMS[0] * 2f32.powf(second as f32 / 12.0);
        params.set_parameters(&[freq, BASE_PARAMS[1], BASE_PARAMS[2]])?;

        let status = engine.status();
        info!(
            "{:>3}s: {:?}, {} chunks, {:.3}s buffered, peaks {:.2}/{:.2}, {:.1}Hz",
            second,
            status.state,
            status.chunks_produced,
            status.buffered_seconds,
            status.output_peaks[0],
            status.output_peaks[1],
            freq
        );
    }

    if let Some(report) = engine.shutdown().await? {
        info!(
            "Run finished: {} chunks, {:.3}s of audio, {} deferrals, {} rebuilds",
            report.chunks_produced, report.final_offset, report.deferrals, report.rebuilds
        );
        if let Some(fault) = report.fault {
            return Err(fault).context("engine run failed");
        }
    }
    Ok(())
}
