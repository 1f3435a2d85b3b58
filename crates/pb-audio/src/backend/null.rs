//! Null audio backend (no sound output)
//!
//! Every stream primitive is recorded so the session can be exercised without
//! a device. A [`NullProbe`] shares the backend state: tests use it to inspect
//! writes, inject failures and drive render periods as the real-time thread
//! would.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use pb_core::BackendError;

use super::{
    AudioBackend, BackendStream, DeviceInfo, ErrorCallback, OutputConfig, OutputParameters,
    Outcome, RenderCallback, StatusFlags, StreamCallbacks,
};

/// Longest a waiting `stop` blocks on an in-flight render period
const STOP_WAIT_LIMIT: Duration = Duration::from_secs(2);

/// One `write` call as the backend saw it
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub stream: usize,
    pub samples: Vec<f32>,
    pub frames: usize,
}

/// One stream opened on the null backend
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub config: OutputConfig,
    pub callback_driven: bool,
    pub started: bool,
    pub closed: bool,
}

#[derive(Default)]
struct NullState {
    initialized: bool,
    devices: Vec<DeviceInfo>,
    default_output: Option<usize>,
    streams: Vec<StreamRecord>,
    writes: Vec<WriteRecord>,
    render: Option<(usize, RenderCallback)>,
    on_error: Option<(usize, ErrorCallback)>,
    fail_open: Option<String>,
    fail_start: Option<String>,
    fail_write: Option<String>,
    stop_waits_for_render: bool,
    rendering: bool,
    stop_timeouts: usize,
}

impl NullState {
    fn release_callbacks(&mut self, stream: usize) {
        if matches!(self.render, Some((owner, _)) if owner == stream) {
            self.render = None;
        }
        if matches!(self.on_error, Some((owner, _)) if owner == stream) {
            self.on_error = None;
        }
    }
}

/// Shared view of a [`NullAudioBackend`]'s state
#[derive(Clone, Default)]
pub struct NullProbe {
    state: Arc<Mutex<NullState>>,
    render_done: Arc<Condvar>,
}

impl NullProbe {
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Every stream ever opened, in open order
    pub fn streams(&self) -> Vec<StreamRecord> {
        self.state.lock().streams.clone()
    }

    /// Streams opened and not yet closed
    pub fn open_streams(&self) -> usize {
        self.state.lock().streams.iter().filter(|s| !s.closed).count()
    }

    /// Every successful write, in order
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn set_devices(&self, devices: Vec<DeviceInfo>, default_output: Option<usize>) {
        let mut state = self.state.lock();
        state.devices = devices;
        state.default_output = default_output;
    }

    /// Make the next `open_output` fail with `message`
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.state.lock().fail_open = Some(message.into());
    }

    /// Make the next `start` fail with `message`
    pub fn fail_next_start(&self, message: impl Into<String>) {
        self.state.lock().fail_start = Some(message.into());
    }

    /// Make every `write` fail with `message` until cleared
    pub fn fail_writes(&self, message: Option<String>) {
        self.state.lock().fail_write = message;
    }

    /// Make `stop` wait for an in-flight render period to return, as real
    /// drivers do. The wait gives up after two seconds and counts a timeout.
    pub fn stop_waits_for_render(&self, wait: bool) {
        self.state.lock().stop_waits_for_render = wait;
    }

    /// Number of `stop` calls that gave up waiting on a render period
    pub fn stop_timeouts(&self) -> usize {
        self.state.lock().stop_timeouts
    }

    /// Whether a started callback stream currently has a render callback
    pub fn has_render_callback(&self) -> bool {
        self.state.lock().render.is_some()
    }

    /// Run one render period for the current callback stream, as the backend's
    /// real-time thread would. Returns `None` if no callback stream is running.
    pub fn render(&self, frames: usize, flags: StatusFlags) -> Option<(Outcome, Vec<f32>)> {
        let (owner, mut callback, channels) = {
            let mut state = self.state.lock();
            let (owner, callback) = state.render.take()?;
            let started = state.streams[owner].started;
            let channels = state.streams[owner].config.params.channels as usize;
            if !started {
                state.render = Some((owner, callback));
                return None;
            }
            state.rendering = true;
            (owner, callback, channels)
        };

        let mut buffer = vec![0.0f32; frames * channels];
        let outcome = callback(&mut buffer, frames, flags);

        let mut state = self.state.lock();
        state.rendering = false;
        self.render_done.notify_all();
        if outcome == Outcome::Abort {
            state.streams[owner].started = false;
        }
        if !state.streams[owner].closed && state.render.is_none() {
            state.render = Some((owner, callback));
        }
        Some((outcome, buffer))
    }

    /// Detach the current render callback so it can be invoked after the
    /// stream is gone, like a late period racing with close.
    pub fn take_render_callback(&self) -> Option<RenderCallback> {
        self.state.lock().render.take().map(|(_, callback)| callback)
    }

    /// Report an asynchronous stream error through the error callback
    pub fn report_error(&self, message: &str) -> bool {
        let taken = self.state.lock().on_error.take();
        let Some((owner, mut on_error)) = taken else {
            return false;
        };
        on_error(message.to_string());
        let mut state = self.state.lock();
        if !state.streams[owner].closed && state.on_error.is_none() {
            state.on_error = Some((owner, on_error));
        }
        true
    }
}

/// Null audio backend (no sound output)
pub struct NullAudioBackend {
    probe: NullProbe,
}

impl NullAudioBackend {
    pub fn new() -> Self {
        let probe = NullProbe::default();
        probe.set_devices(default_devices(), Some(0));
        Self { probe }
    }

    /// Shared state for inspection and fault injection
    pub fn probe(&self) -> NullProbe {
        self.probe.clone()
    }
}

impl Default for NullAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn default_devices() -> Vec<DeviceInfo> {
    vec![
        DeviceInfo {
            index: 0,
            name: "Null Output".to_string(),
            max_input_channels: 0,
            max_output_channels: 2,
            default_sample_rate: 44_100.0,
            host_api: 0,
            default_low_input_latency: 0.0,
            default_low_output_latency: 0.01,
            default_high_input_latency: 0.0,
            default_high_output_latency: 0.1,
        },
        DeviceInfo {
            index: 1,
            name: "Null Multichannel".to_string(),
            max_input_channels: 2,
            max_output_channels: 8,
            default_sample_rate: 48_000.0,
            host_api: 0,
            default_low_input_latency: 0.005,
            default_low_output_latency: 0.005,
            default_high_input_latency: 0.08,
            default_high_output_latency: 0.08,
        },
    ]
}

impl AudioBackend for NullAudioBackend {
    fn initialize(&mut self) -> Result<(), BackendError> {
        self.probe.state.lock().initialized = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), BackendError> {
        let mut state = self.probe.state.lock();
        if !state.initialized {
            return Err(BackendError::new("Audio backend not initialized"));
        }
        state.initialized = false;
        Ok(())
    }

    fn version_text(&self) -> String {
        format!("null backend {}", env!("CARGO_PKG_VERSION"))
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        let state = self.probe.state.lock();
        if !state.initialized {
            return Err(BackendError::new("Audio backend not initialized"));
        }
        Ok(state.devices.clone())
    }

    fn default_output_device(&self) -> Option<usize> {
        self.probe.state.lock().default_output
    }

    fn is_output_format_supported(&self, params: &OutputParameters, sample_rate: f64) -> bool {
        let state = self.probe.state.lock();
        state.devices.get(params.device).is_some_and(|device| {
            params.channels > 0
                && params.channels <= device.max_output_channels
                && (8_000.0..=192_000.0).contains(&sample_rate)
        })
    }

    fn open_output(
        &mut self,
        config: &OutputConfig,
        callbacks: Option<StreamCallbacks>,
    ) -> Result<Box<dyn BackendStream>, BackendError> {
        let mut state = self.probe.state.lock();
        if !state.initialized {
            return Err(BackendError::new("Audio backend not initialized"));
        }
        if let Some(message) = state.fail_open.take() {
            return Err(BackendError::new(message));
        }
        let Some(device) = state.devices.get(config.params.device) else {
            return Err(BackendError::new("Invalid device"));
        };
        if config.params.channels > device.max_output_channels {
            return Err(BackendError::new("Invalid number of channels"));
        }

        let index = state.streams.len();
        state.streams.push(StreamRecord {
            config: *config,
            callback_driven: callbacks.is_some(),
            started: false,
            closed: false,
        });
        if let Some(callbacks) = callbacks {
            state.render = Some((index, callbacks.render));
            state.on_error = Some((index, callbacks.on_error));
        }

        Ok(Box::new(NullStream {
            index,
            probe: self.probe.clone(),
        }))
    }
}

struct NullStream {
    index: usize,
    probe: NullProbe,
}

impl BackendStream for NullStream {
    fn start(&mut self) -> Result<(), BackendError> {
        let mut state = self.probe.state.lock();
        if let Some(message) = state.fail_start.take() {
            return Err(BackendError::new(message));
        }
        state.streams[self.index].started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        let mut state = self.probe.state.lock();
        if state.stop_waits_for_render {
            let wait = self.probe.render_done.wait_while_for(
                &mut state,
                |state| state.rendering,
                STOP_WAIT_LIMIT,
            );
            if wait.timed_out() {
                state.stop_timeouts += 1;
                return Err(BackendError::new("Timed out waiting for the render period"));
            }
        }
        let record = &mut state.streams[self.index];
        if record.closed {
            return Err(BackendError::new("Invalid stream pointer"));
        }
        record.started = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        let mut state = self.probe.state.lock();
        if state.streams[self.index].closed {
            return Ok(());
        }
        state.streams[self.index].closed = true;
        state.streams[self.index].started = false;
        state.release_callbacks(self.index);
        Ok(())
    }

    fn write(&mut self, samples: &[f32], frames: usize) -> Result<(), BackendError> {
        let mut state = self.probe.state.lock();
        if let Some(message) = state.fail_write.clone() {
            return Err(BackendError::new(message));
        }
        let record = &state.streams[self.index];
        if record.callback_driven {
            return Err(BackendError::new("Can not write to a callback stream"));
        }
        if !record.started {
            return Err(BackendError::new("Stream is stopped"));
        }
        state.writes.push(WriteRecord {
            stream: self.index,
            samples: samples.to_vec(),
            frames,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_config() -> OutputConfig {
        OutputConfig {
            params: OutputParameters {
                device: 0,
                channels: 2,
                suggested_latency: 0.01,
            },
            sample_rate: 44_100.0,
            frames_per_buffer: 256,
        }
    }

    #[test]
    fn records_writes_once_started() {
        let mut backend = NullAudioBackend::new();
        let probe = backend.probe();
        backend.initialize().unwrap();

        let mut stream = backend.open_output(&stereo_config(), None).unwrap();
        assert!(stream.write(&[0.5, 0.5], 1).is_err());

        stream.start().unwrap();
        stream.write(&[0.5, 0.5], 1).unwrap();
        assert_eq!(probe.writes()[0].frames, 1);

        stream.stop().unwrap();
        stream.close().unwrap();
        stream.close().unwrap();
        assert_eq!(probe.open_streams(), 0);
    }

    #[test]
    fn open_requires_initialize() {
        let mut backend = NullAudioBackend::new();
        let err = backend.open_output(&stereo_config(), None).err().unwrap();
        assert_eq!(err.message(), "Audio backend not initialized");
    }

    #[test]
    fn render_drives_callback_until_closed() {
        let mut backend = NullAudioBackend::new();
        let probe = backend.probe();
        backend.initialize().unwrap();

        let callbacks = StreamCallbacks {
            render: Box::new(|buffer, _, _| {
                buffer.fill(0.25);
                Outcome::Continue
            }),
            on_error: Box::new(|_| {}),
        };
        let mut stream = backend.open_output(&stereo_config(), Some(callbacks)).unwrap();
        assert!(probe.render(4, StatusFlags::empty()).is_none());

        stream.start().unwrap();
        let (outcome, buffer) = probe.render(4, StatusFlags::empty()).unwrap();
        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(buffer, vec![0.25; 8]);

        stream.close().unwrap();
        assert!(probe.render(4, StatusFlags::empty()).is_none());
    }

    #[test]
    fn waiting_stop_returns_once_render_finishes() {
        let mut backend = NullAudioBackend::new();
        let probe = backend.probe();
        backend.initialize().unwrap();
        probe.stop_waits_for_render(true);

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let callbacks = StreamCallbacks {
            render: Box::new(move |_, _, _| {
                entered_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                Outcome::Continue
            }),
            on_error: Box::new(|_| {}),
        };
        let mut stream = backend.open_output(&stereo_config(), Some(callbacks)).unwrap();
        stream.start().unwrap();

        let renderer = probe.clone();
        let period = std::thread::spawn(move || renderer.render(4, StatusFlags::empty()));
        entered_rx.recv().unwrap();
        stream.stop().unwrap();
        assert!(period.join().unwrap().is_some());
        assert_eq!(probe.stop_timeouts(), 0);
        stream.close().unwrap();
    }

    #[test]
    fn format_support_checks_channels_and_rate() {
        let backend = NullAudioBackend::new();
        let params = OutputParameters {
            device: 1,
            channels: 8,
            suggested_latency: 0.0,
        };
        assert!(backend.is_output_format_supported(&params, 48_000.0));
        assert!(!backend.is_output_format_supported(&params, 1_000.0));
        let too_wide = OutputParameters { channels: 9, ..params };
        assert!(!backend.is_output_format_supported(&too_wide, 48_000.0));
    }
}
