//! pulsebridge - audio output streaming
//!
//! Command-line front end: lists devices and plays test tones through either
//! the blocking write path or the callback bridge.

use std::env;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use pb_audio::{AudioSession, CpalBackend, FillInfo, StreamEvent};
use pb_core::config::Config;

const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 0.2;

fn main() {
    let args: Vec<String> = env::args().collect();

    let config = Config::load().unwrap_or_default();
    pb_core::logging::init(&config);

    if let Err(err) = run(&args, &config) {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(args: &[String], config: &Config) -> Result<()> {
    let program = args.first().map(String::as_str).unwrap_or("pulsebridge");
    let command = args.get(1).map(String::as_str).unwrap_or("devices");

    match command {
        "version" => {
            let session = AudioSession::with_config(Box::new(CpalBackend::new()), config);
            println!("pulsebridge {}", env!("CARGO_PKG_VERSION"));
            println!("{}", session.backend_version());
            Ok(())
        }
        "devices" => list_devices(config),
        "tone" => play_blocking_tone(config, seconds_arg(args)?),
        "callback-tone" => play_callback_tone(config, seconds_arg(args)?),
        _ => {
            eprintln!("Usage: {} [version | devices | tone [seconds] | callback-tone [seconds]]", program);
            std::process::exit(2);
        }
    }
}

fn seconds_arg(args: &[String]) -> Result<f64> {
    let Some(raw) = args.get(2) else {
        return Ok(2.0);
    };
    let seconds: f64 = raw
        .parse()
        .with_context(|| format!("invalid duration: {}", raw))?;
    if !(seconds.is_finite() && seconds > 0.0) {
        bail!("duration must be positive: {}", raw);
    }
    Ok(seconds)
}

fn list_devices(config: &Config) -> Result<()> {
    let session = AudioSession::with_config(Box::new(CpalBackend::new()), config);
    session.initialize()?;

    let default = session.default_output_device();
    let devices = session.list_devices()?;
    println!("{} device(s), backend {}", devices.len(), session.backend_version());
    for device in &devices {
        let marker = if Some(device.index) == default { "*" } else { " " };
        println!(
            "{} {:>2}: {} (in {}, out {}, {} Hz, latency {:.1}-{:.1} ms)",
            marker,
            device.index,
            device.name,
            device.max_input_channels,
            device.max_output_channels,
            device.default_sample_rate,
            device.default_low_output_latency * 1000.0,
            device.default_high_output_latency * 1000.0,
        );
    }

    session.shutdown()?;
    Ok(())
}

/// Sine oscillator writing interleaved frames
struct Sine {
    phase: f32,
    step: f32,
}

impl Sine {
    fn new(frequency: f32, sample_rate: f64) -> Self {
        Self {
            phase: 0.0,
            step: frequency / sample_rate as f32,
        }
    }

    fn fill(&mut self, buffer: &mut [f32], channels: usize) {
        for frame in buffer.chunks_mut(channels.max(1)) {
            let value = (self.phase * TAU).sin() * TONE_AMPLITUDE;
            frame.fill(value);
            self.phase = (self.phase + self.step).fract();
        }
    }
}

fn play_blocking_tone(config: &Config, seconds: f64) -> Result<()> {
    let session = AudioSession::with_config(Box::new(CpalBackend::new()), config);
    session.initialize()?;
    let id = session.open_default_stream().context("failed to open output stream")?;
    let status = session.stream_status(id)?;
    tracing::info!(
        "Playing {} Hz for {:.1}s on stream {} (blocking)",
        TONE_HZ,
        seconds,
        id
    );

    let channels = status.channels as usize;
    let mut sine = Sine::new(TONE_HZ, status.sample_rate);
    let mut buffer = vec![0.0f32; status.frames_per_buffer as usize * channels];
    let total_frames = (seconds * status.sample_rate) as u64;
    let mut written = 0u64;
    while written < total_frames {
        sine.fill(&mut buffer, channels);
        session.write_stream(id, &mut buffer)?;
        written += status.frames_per_buffer as u64;
    }

    session.close_stream(id);
    session.shutdown()?;
    Ok(())
}

fn play_callback_tone(config: &Config, seconds: f64) -> Result<()> {
    let session = AudioSession::shared(Box::new(CpalBackend::new()), config);
    session.initialize()?;

    let event_count = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&event_count);
    session.set_stream_event_handler(Box::new(move |event: &StreamEvent| {
        if event.message.is_empty() {
            tracing::warn!("stream event: {}", event.kind);
        } else {
            tracing::error!("stream event: {}: {}", event.kind, event.message);
        }
        *counter.lock() += 1;
    }))?;

    let options = session.callback_options();
    let mut sine = Sine::new(TONE_HZ, options.sample_rate);
    let id = session
        .open_callback_stream(
            options,
            Box::new(move |buffer: &mut [f32], info: FillInfo| {
                sine.fill(buffer, info.channels as usize);
            }),
        )
        .context("failed to open callback stream")?;
    tracing::info!(
        "Playing {} Hz for {:.1}s on stream {} (callback)",
        TONE_HZ,
        seconds,
        id
    );

    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }

    session.close_stream(id);
    let bridge = session.bridge();
    tracing::info!(
        "{} fills, {} aborted, {} events ({} dropped)",
        bridge.fills_completed(),
        bridge.fills_aborted(),
        *event_count.lock(),
        bridge.events_dropped()
    );
    session.shutdown()?;
    Ok(())
}
