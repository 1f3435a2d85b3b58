//! cpal audio backend
//!
//! `cpal::Stream` is not `Send` on every host, so each stream lives on its own
//! owner thread and is driven through a small command channel. Blocking
//! streams are fed through a bounded sample queue that the device callback
//! drains; callback streams call the render callback directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use pb_core::BackendError;

use super::{
    AudioBackend, BackendStream, DeviceInfo, Outcome, OutputConfig, OutputParameters,
    RenderCallback, StatusFlags, StreamCallbacks, FALLBACK_LATENCY,
};

/// Periods of audio a blocking stream may have queued ahead of the device
const QUEUE_PERIODS: usize = 4;
/// How often an owner thread checks for an aborted callback stream
const OWNER_POLL: Duration = Duration::from_millis(10);
/// How long a blocked write waits before re-checking the stream state
const WRITE_POLL: Duration = Duration::from_millis(100);
/// Largest buffer size used when deriving the default high latency
const HIGH_LATENCY_FRAMES: u32 = 4096;

/// Backend on top of the platform's default cpal host
pub struct CpalBackend {
    host_id: cpal::HostId,
    initialized: bool,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host_id: cpal::default_host().id(),
            initialized: false,
        }
    }

    fn host(&self) -> Result<cpal::Host, BackendError> {
        cpal::host_from_id(self.host_id).map_err(|err| BackendError::new(err.to_string()))
    }

    fn ensure_initialized(&self) -> Result<(), BackendError> {
        if self.initialized {
            Ok(())
        } else {
            Err(BackendError::new("Audio backend not initialized"))
        }
    }

    fn host_api_index(&self) -> usize {
        cpal::available_hosts()
            .iter()
            .position(|host| *host == self.host_id)
            .unwrap_or(0)
    }
}

/// Device at `index` in the host's device list
fn device_at(host_id: cpal::HostId, index: usize) -> Result<cpal::Device, BackendError> {
    cpal::host_from_id(host_id)
        .map_err(|err| BackendError::new(err.to_string()))?
        .devices()
        .map_err(|err| BackendError::new(err.to_string()))?
        .nth(index)
        .ok_or_else(|| BackendError::new("Invalid device"))
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn initialize(&mut self) -> Result<(), BackendError> {
        self.host()?;
        self.initialized = true;
        tracing::debug!(target: "stream", "cpal host: {}", self.host_id.name());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), BackendError> {
        self.initialized = false;
        Ok(())
    }

    fn version_text(&self) -> String {
        format!("cpal 0.15 ({})", self.host_id.name())
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        self.ensure_initialized()?;
        let host_api = self.host_api_index();
        let devices = self
            .host()?
            .devices()
            .map_err(|err| BackendError::new(err.to_string()))?;
        Ok(devices
            .enumerate()
            .map(|(index, device)| describe(index, &device, host_api))
            .collect())
    }

    fn default_output_device(&self) -> Option<usize> {
        if !self.initialized {
            return None;
        }
        let host = self.host().ok()?;
        let name = host.default_output_device()?.name().ok()?;
        host.devices()
            .ok()?
            .position(|device| device.name().map(|n| n == name).unwrap_or(false))
    }

    fn is_output_format_supported(&self, params: &OutputParameters, sample_rate: f64) -> bool {
        if self.ensure_initialized().is_err() {
            return false;
        }
        let Ok(device) = device_at(self.host_id, params.device) else {
            return false;
        };
        find_config(&device, params.channels, sample_rate).is_some()
    }

    fn open_output(
        &mut self,
        config: &OutputConfig,
        callbacks: Option<StreamCallbacks>,
    ) -> Result<Box<dyn BackendStream>, BackendError> {
        self.ensure_initialized()?;
        let device = device_at(self.host_id, config.params.device)?;
        let range = find_config(&device, config.params.channels, config.sample_rate)
            .ok_or_else(|| BackendError::new("Invalid sample rate"))?;

        let buffer_size = match range.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max }
                if (*min..=*max).contains(&config.frames_per_buffer) =>
            {
                cpal::BufferSize::Fixed(config.frames_per_buffer)
            }
            _ => cpal::BufferSize::Default,
        };
        let stream_config = cpal::StreamConfig {
            channels: config.params.channels,
            sample_rate: cpal::SampleRate(config.sample_rate.round() as u32),
            buffer_size,
        };

        CpalStream::spawn(self.host_id, stream_config, *config, callbacks)
            .map(|stream| Box::new(stream) as Box<dyn BackendStream>)
    }
}

fn describe(index: usize, device: &cpal::Device, host_api: usize) -> DeviceInfo {
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let mut max_output_channels = 0;
    let mut output_buffer = None;
    if let Ok(configs) = device.supported_output_configs() {
        for range in configs {
            max_output_channels = max_output_channels.max(range.channels());
            output_buffer = output_buffer.or(Some(range.buffer_size().clone()));
        }
    }
    let mut max_input_channels = 0;
    let mut input_buffer = None;
    if let Ok(configs) = device.supported_input_configs() {
        for range in configs {
            max_input_channels = max_input_channels.max(range.channels());
            input_buffer = input_buffer.or(Some(range.buffer_size().clone()));
        }
    }

    let default_sample_rate = device
        .default_output_config()
        .or_else(|_| device.default_input_config())
        .map(|config| config.sample_rate().0 as f64)
        .unwrap_or(0.0);
    let (low_out, high_out) = latencies(output_buffer.as_ref(), default_sample_rate);
    let (low_in, high_in) = latencies(input_buffer.as_ref(), default_sample_rate);

    DeviceInfo {
        index,
        name,
        max_input_channels,
        max_output_channels,
        default_sample_rate,
        host_api,
        default_low_input_latency: low_in,
        default_low_output_latency: low_out,
        default_high_input_latency: high_in,
        default_high_output_latency: high_out,
    }
}

/// Low and high latency in seconds derived from the device's buffer size range
fn latencies(buffer: Option<&cpal::SupportedBufferSize>, sample_rate: f64) -> (f64, f64) {
    match buffer {
        Some(cpal::SupportedBufferSize::Range { min, max }) if sample_rate > 0.0 => {
            let high = (*max).min(HIGH_LATENCY_FRAMES).max(*min);
            (*min as f64 / sample_rate, high as f64 / sample_rate)
        }
        _ => (FALLBACK_LATENCY, FALLBACK_LATENCY * 2.0),
    }
}

/// `f32` output config range matching the channel count and containing the rate
fn find_config(
    device: &cpal::Device,
    channels: u16,
    sample_rate: f64,
) -> Option<cpal::SupportedStreamConfigRange> {
    if !(sample_rate.is_finite() && sample_rate > 0.0) {
        return None;
    }
    let rate = sample_rate.round() as u32;
    device.supported_output_configs().ok()?.find(|range| {
        range.channels() == channels
            && range.sample_format() == cpal::SampleFormat::F32
            && (range.min_sample_rate().0..=range.max_sample_rate().0).contains(&rate)
    })
}

enum Command {
    Play(Sender<Result<(), BackendError>>),
    Pause(Sender<Result<(), BackendError>>),
    Close,
}

/// Samples queued by blocking writes, drained by the device callback
struct PushQueue {
    samples: Mutex<VecDeque<f32>>,
    space: Condvar,
    capacity: usize,
}

impl PushQueue {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Condvar::new(),
            capacity,
        }
    }

    /// Real-time side: copy queued samples into `out`, padding with silence.
    /// Returns false when the queue ran dry.
    fn drain_into(&self, out: &mut [f32]) -> bool {
        let Some(mut queued) = self.samples.try_lock() else {
            out.fill(0.0);
            return false;
        };
        let available = queued.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(queued.drain(..available)) {
            *slot = sample;
        }
        out[available..].fill(0.0);
        drop(queued);
        self.space.notify_one();
        available == out.len()
    }
}

/// State shared between a stream handle, its owner thread and its callback
struct StreamShared {
    running: AtomicBool,
    aborted: AtomicBool,
    queue: Option<PushQueue>,
}

/// One cpal output stream, driven from its owner thread
pub struct CpalStream {
    commands: Sender<Command>,
    owner: Option<JoinHandle<()>>,
    shared: Arc<StreamShared>,
    channels: usize,
    closed: bool,
}

impl CpalStream {
    fn spawn(
        host_id: cpal::HostId,
        stream_config: cpal::StreamConfig,
        config: OutputConfig,
        callbacks: Option<StreamCallbacks>,
    ) -> Result<Self, BackendError> {
        let channels = config.params.channels as usize;
        let queue = callbacks.is_none().then(|| {
            PushQueue::new(config.frames_per_buffer as usize * channels * QUEUE_PERIODS)
        });
        let shared = Arc::new(StreamShared {
            running: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            queue,
        });

        let (commands, command_rx) = channel::bounded::<Command>(1);
        let (ready_tx, ready_rx) = channel::bounded::<Result<(), BackendError>>(1);
        let owner_shared = Arc::clone(&shared);
        let owner = thread::Builder::new()
            .name("pb-cpal-stream".to_string())
            .spawn(move || {
                let built = device_at(host_id, config.params.device).and_then(|device| {
                    build_stream(&device, &stream_config, &owner_shared, callbacks)
                });
                let stream = match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                own_stream(stream, &owner_shared, &command_rx);
            })
            .map_err(|err| BackendError::new(format!("failed to spawn stream thread: {err}")))?;

        let built = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(BackendError::new("Stream thread exited")));
        if let Err(err) = built {
            let _ = owner.join();
            return Err(err);
        }

        Ok(Self {
            commands,
            owner: Some(owner),
            shared,
            channels,
            closed: false,
        })
    }

    fn request(&self, command: fn(Sender<Result<(), BackendError>>) -> Command) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::new("Invalid stream pointer"));
        }
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.commands
            .send(command(reply_tx))
            .map_err(|_| BackendError::new("Stream thread exited"))?;
        reply_rx
            .recv()
            .unwrap_or_else(|_| Err(BackendError::new("Stream thread exited")))
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<StreamShared>,
    callbacks: Option<StreamCallbacks>,
) -> Result<cpal::Stream, BackendError> {
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0 as f64;

    let stream = match callbacks {
        Some(StreamCallbacks { render, mut on_error }) => {
            let shared = Arc::clone(shared);
            let mut render = RenderState::new(render, channels, sample_rate);
            device.build_output_stream(
                config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    if shared.aborted.load(Ordering::Acquire) {
                        data.fill(0.0);
                        return;
                    }
                    if render.run(data, info) == Outcome::Abort {
                        shared.aborted.store(true, Ordering::Release);
                    }
                },
                move |err| on_error(err.to_string()),
                None,
            )
        }
        None => {
            let shared = Arc::clone(shared);
            device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if let Some(queue) = shared.queue.as_ref() {
                        queue.drain_into(data);
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| tracing::error!(target: "stream", "cpal stream error: {}", err),
                None,
            )
        }
    };
    stream.map_err(|err| BackendError::new(err.to_string()))
}

/// Render callback plus the timing needed to infer underflow
struct RenderState {
    render: RenderCallback,
    channels: usize,
    sample_rate: f64,
    last_callback: Option<cpal::StreamInstant>,
}

impl RenderState {
    fn new(render: RenderCallback, channels: usize, sample_rate: f64) -> Self {
        Self {
            render,
            channels,
            sample_rate,
            last_callback: None,
        }
    }

    fn run(&mut self, data: &mut [f32], info: &cpal::OutputCallbackInfo) -> Outcome {
        let frames = data.len() / self.channels.max(1);
        let now = info.timestamp().callback;

        // cpal has no status flags; a callback arriving well after the previous
        // period ended means the device ran dry in between.
        let mut flags = StatusFlags::empty();
        if let Some(last) = self.last_callback {
            let period = frames as f64 / self.sample_rate;
            if let Some(gap) = now.duration_since(&last) {
                if gap.as_secs_f64() > period * 1.5 {
                    flags |= StatusFlags::OUTPUT_UNDERFLOW;
                }
            }
        }
        self.last_callback = Some(now);

        (self.render)(data, frames, flags)
    }
}

fn own_stream(stream: cpal::Stream, shared: &StreamShared, commands: &Receiver<Command>) {
    loop {
        match commands.recv_timeout(OWNER_POLL) {
            Ok(Command::Play(reply)) => {
                shared.aborted.store(false, Ordering::Release);
                let result = stream.play().map_err(|err| BackendError::new(err.to_string()));
                shared.running.store(result.is_ok(), Ordering::Release);
                let _ = reply.send(result);
            }
            Ok(Command::Pause(reply)) => {
                shared.running.store(false, Ordering::Release);
                let result = stream.pause().map_err(|err| BackendError::new(err.to_string()));
                let _ = reply.send(result);
            }
            Ok(Command::Close) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if shared.aborted.load(Ordering::Acquire) && shared.running.swap(false, Ordering::AcqRel) {
                    if let Err(err) = stream.pause() {
                        tracing::warn!(target: "stream", "failed to pause aborted stream: {}", err);
                    }
                    tracing::debug!(target: "stream", "callback stream aborted");
                }
            }
        }
    }
    shared.running.store(false, Ordering::Release);
    if let Some(queue) = shared.queue.as_ref() {
        queue.space.notify_all();
    }
    drop(stream);
}

impl BackendStream for CpalStream {
    fn start(&mut self) -> Result<(), BackendError> {
        self.request(Command::Play)
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Ok(());
        }
        let result = self.request(Command::Pause);
        if let Some(queue) = self.shared.queue.as_ref() {
            queue.samples.lock().clear();
            queue.space.notify_all();
        }
        result
    }

    fn close(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.commands.send(Command::Close);
        if let Some(owner) = self.owner.take() {
            if owner.join().is_err() {
                return Err(BackendError::new("Stream thread panicked"));
            }
        }
        Ok(())
    }

    fn write(&mut self, samples: &[f32], frames: usize) -> Result<(), BackendError> {
        let Some(queue) = self.shared.queue.as_ref() else {
            return Err(BackendError::new("Can not write to a callback stream"));
        };
        if self.closed {
            return Err(BackendError::new("Invalid stream pointer"));
        }

        let mut pending = &samples[..(frames * self.channels).min(samples.len())];
        while !pending.is_empty() {
            if !self.shared.running.load(Ordering::Acquire) {
                return Err(BackendError::new("Stream is stopped"));
            }
            let mut queued = queue.samples.lock();
            let space = queue.capacity.saturating_sub(queued.len());
            if space == 0 {
                queue.space.wait_for(&mut queued, WRITE_POLL);
                continue;
            }
            let (now, later) = pending.split_at(space.min(pending.len()));
            queued.extend(now.iter().copied());
            pending = later;
        }
        Ok(())
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(target: "stream", "cpal stream close failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latencies_follow_buffer_range() {
        let range = cpal::SupportedBufferSize::Range { min: 441, max: 1_000_000 };
        let (low, high) = latencies(Some(&range), 44_100.0);
        assert!((low - 0.01).abs() < 1e-9);
        assert!((high - HIGH_LATENCY_FRAMES as f64 / 44_100.0).abs() < 1e-9);

        let (low, high) = latencies(Some(&cpal::SupportedBufferSize::Unknown), 44_100.0);
        assert_eq!(low, FALLBACK_LATENCY);
        assert_eq!(high, FALLBACK_LATENCY * 2.0);
    }

    #[test]
    fn push_queue_pads_with_silence() {
        let queue = PushQueue::new(8);
        queue.samples.lock().extend([0.5f32, 0.25]);
        let mut out = [1.0f32; 4];
        assert!(!queue.drain_into(&mut out));
        assert_eq!(out, [0.5, 0.25, 0.0, 0.0]);
        assert!(queue.samples.lock().is_empty());
    }

    #[test]
    fn uninitialized_backend_reports_no_devices() {
        let backend = CpalBackend::new();
        assert!(backend.devices().is_err());
        assert_eq!(backend.default_output_device(), None);
    }
}
