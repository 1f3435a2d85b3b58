//! Stream registry
//!
//! Single source of truth for which stream is open and its mutable
//! parameters. Holds at most [`StreamRegistry::DEFAULT_CAPACITY`] streams.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pb_core::config::StreamConfig;
use pb_core::{stream_debug, BackendError, StreamError, StreamId};

use crate::backend::{
    AudioBackend, BackendStream, OutputConfig, OutputParameters, Outcome, RenderCallback,
    StreamCallbacks, FALLBACK_LATENCY,
};
use crate::bridge::{CallbackBridge, FillHandler, FillInvoker};
use crate::events::EventReporter;
use crate::write_path::apply_volume;

/// Backend stream shared between the registry and in-progress writes
pub type SharedStream = Arc<Mutex<Box<dyn BackendStream>>>;

/// Stream gain, read and written as a single atomic scalar
#[derive(Debug)]
pub struct Volume(AtomicU32);

impl Volume {
    pub const MIN: f32 = 0.0;
    pub const MAX: f32 = 2.0;

    pub fn new() -> Self {
        Self(AtomicU32::new(1.0f32.to_bits()))
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Store `value` clamped to `[MIN, MAX]` and return what was stored.
    /// NaN is stored as `MIN`.
    pub fn set(&self, value: f32) -> f32 {
        let clamped = if value.is_nan() {
            Self::MIN
        } else {
            value.clamp(Self::MIN, Self::MAX)
        };
        self.0.store(clamped.to_bits(), Ordering::Relaxed);
        clamped
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::new()
    }
}

/// How a stream is fed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Fed by explicit writes from the controller
    Blocking,
    /// Filled once per period through the callback bridge
    Callback,
}

/// Parameters of a blocking stream request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamRequest {
    /// Device index; negative values are rejected
    pub device: i32,
    pub sample_rate: f64,
    pub channels: u16,
    pub frames_per_buffer: u32,
}

impl StreamRequest {
    /// Check the request against the backend's device count
    pub fn validate(&self, device_count: usize) -> Result<usize, StreamError> {
        let device = usize::try_from(self.device)
            .ok()
            .filter(|device| *device < device_count)
            .ok_or_else(|| invalid_device(self.device, device_count))?;
        validate_shape(self.channels, self.sample_rate, self.frames_per_buffer)?;
        Ok(device)
    }
}

fn invalid_device(device: impl fmt::Display, device_count: usize) -> StreamError {
    if device_count == 0 {
        return StreamError::invalid(format!(
            "Invalid device index: {device}. No devices available"
        ));
    }
    StreamError::invalid(format!(
        "Invalid device index: {}. Available devices: 0-{}",
        device,
        device_count - 1
    ))
}

/// The backend's default output device
pub(crate) fn default_device(backend: &dyn AudioBackend) -> Result<usize, StreamError> {
    backend
        .default_output_device()
        .ok_or_else(|| BackendError::new("No default output device").into())
}

fn validate_shape(channels: u16, sample_rate: f64, frames_per_buffer: u32) -> Result<(), StreamError> {
    if channels == 0 {
        return Err(StreamError::invalid("Channel count must be positive"));
    }
    if !(sample_rate.is_finite() && sample_rate > 0.0) {
        return Err(StreamError::invalid("Sample rate must be positive"));
    }
    if frames_per_buffer == 0 {
        return Err(StreamError::invalid("framesPerBuffer must be positive"));
    }
    Ok(())
}

/// Options for a callback-driven stream. Unset fields take defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallbackStreamOptions {
    /// `None` selects the default output device
    pub device: Option<usize>,
    pub channels: u16,
    pub sample_rate: f64,
    pub frames_per_buffer: u32,
    /// Used only when greater than zero; otherwise the device's default low
    /// output latency applies
    pub suggested_latency: Option<f64>,
}

impl CallbackStreamOptions {
    pub fn from_defaults(defaults: &StreamConfig) -> Self {
        Self {
            device: None,
            channels: defaults.channels,
            sample_rate: defaults.sample_rate,
            frames_per_buffer: defaults.frames_per_buffer,
            suggested_latency: None,
        }
    }
}

impl Default for CallbackStreamOptions {
    fn default() -> Self {
        Self::from_defaults(&StreamConfig::default())
    }
}

/// One open stream
pub struct StreamEntry {
    pub id: StreamId,
    pub kind: StreamKind,
    pub channels: u16,
    pub sample_rate: f64,
    pub frames_per_buffer: u32,
    pub(crate) stream: SharedStream,
    pub(crate) volume: Arc<Volume>,
}

impl StreamEntry {
    pub fn volume(&self) -> f32 {
        self.volume.get()
    }

    /// Stop then close the backend stream. Failures are logged and swallowed;
    /// the entry is gone either way.
    pub fn shutdown(self) {
        let mut stream = self.stream.lock();
        if let Err(err) = stream.stop() {
            tracing::warn!(target: "stream", "stream {} stop failed: {}", self.id, err);
        }
        if let Err(err) = stream.close() {
            tracing::warn!(target: "stream", "stream {} close failed: {}", self.id, err);
        }
        stream_debug!("stream {} closed", self.id);
    }
}

/// Table of open streams
pub struct StreamRegistry {
    entries: BTreeMap<StreamId, StreamEntry>,
    next_id: StreamId,
    capacity: usize,
}

impl StreamRegistry {
    pub const DEFAULT_CAPACITY: usize = 1;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.entries.keys().copied().collect()
    }

    pub fn get(&self, id: StreamId) -> Result<&StreamEntry, StreamError> {
        self.entries.get(&id).ok_or(StreamError::NotFound(id))
    }

    /// Fail with `AlreadyOpen` if no slot is free
    pub fn ensure_vacancy(&self) -> Result<(), StreamError> {
        if self.entries.len() >= self.capacity {
            return Err(StreamError::AlreadyOpen);
        }
        Ok(())
    }

    /// Open and start a blocking stream
    pub fn open_blocking(
        &mut self,
        backend: &mut dyn AudioBackend,
        request: StreamRequest,
    ) -> Result<StreamId, StreamError> {
        let device = request.validate(backend.device_count()?)?;
        self.ensure_vacancy()?;

        let suggested_latency = backend
            .device_info(device)
            .map(|info| info.default_low_output_latency)
            .unwrap_or(FALLBACK_LATENCY);
        let config = OutputConfig {
            params: OutputParameters {
                device,
                channels: request.channels,
                suggested_latency,
            },
            sample_rate: request.sample_rate,
            frames_per_buffer: request.frames_per_buffer,
        };

        let stream = start_stream(backend, &config, None)?;
        Ok(self.insert(StreamKind::Blocking, &config, stream, Arc::new(Volume::new())))
    }

    /// Open and start a callback-driven stream. `handler` is bound as the fill
    /// endpoint before the backend stream starts and released again if opening
    /// fails.
    pub fn open_callback_driven(
        &mut self,
        backend: &mut dyn AudioBackend,
        bridge: &CallbackBridge,
        options: CallbackStreamOptions,
        handler: FillHandler,
    ) -> Result<StreamId, StreamError> {
        self.ensure_vacancy()?;
        let device = match options.device {
            Some(device) => device,
            None => default_device(backend)?,
        };
        let device_count = backend.device_count()?;
        if device >= device_count {
            return Err(invalid_device(device, device_count));
        }
        validate_shape(options.channels, options.sample_rate, options.frames_per_buffer)?;

        let suggested_latency = match options.suggested_latency {
            Some(latency) if latency > 0.0 => latency,
            _ => backend
                .device_info(device)
                .map(|info| info.default_low_output_latency)
                .unwrap_or(FALLBACK_LATENCY),
        };
        let config = OutputConfig {
            params: OutputParameters {
                device,
                channels: options.channels,
                suggested_latency,
            },
            sample_rate: options.sample_rate,
            frames_per_buffer: options.frames_per_buffer,
        };

        bridge.bind_fill(handler, options.channels)?;

        let volume = Arc::new(Volume::new());
        let reporter = EventReporter::new(bridge.clone());
        let invoker =
            bridge.fill_invoker(options.frames_per_buffer as usize * options.channels as usize);
        let callbacks = StreamCallbacks {
            render: render_callback(invoker, reporter.clone(), Arc::clone(&volume)),
            on_error: Box::new(move |message| reporter.report_error(message)),
        };

        match start_stream(backend, &config, Some(callbacks)) {
            Ok(stream) => Ok(self.insert(StreamKind::Callback, &config, stream, volume)),
            Err(err) => {
                bridge.release_fill();
                Err(err)
            }
        }
    }

    /// Clamp and store the stream's volume, returning the stored value
    pub fn set_volume(&self, id: StreamId, value: f32) -> Result<f32, StreamError> {
        Ok(self.get(id)?.volume.set(value))
    }

    pub fn volume(&self, id: StreamId) -> Result<f32, StreamError> {
        Ok(self.get(id)?.volume())
    }

    /// Remove an entry; `None` if the id is unknown
    pub fn take(&mut self, id: StreamId) -> Option<StreamEntry> {
        self.entries.remove(&id)
    }

    /// Remove every entry
    pub fn take_all(&mut self) -> Vec<StreamEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn insert(
        &mut self,
        kind: StreamKind,
        config: &OutputConfig,
        stream: Box<dyn BackendStream>,
        volume: Arc<Volume>,
    ) -> StreamId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            StreamEntry {
                id,
                kind,
                channels: config.params.channels,
                sample_rate: config.sample_rate,
                frames_per_buffer: config.frames_per_buffer,
                stream: Arc::new(Mutex::new(stream)),
                volume,
            },
        );
        stream_debug!(
            "stream {} opened ({:?}, device {}, {} ch, {} Hz, {} frames)",
            id,
            kind,
            config.params.device,
            config.params.channels,
            config.sample_rate,
            config.frames_per_buffer
        );
        id
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Open and start a backend stream, closing it again if start fails.
fn start_stream(
    backend: &mut dyn AudioBackend,
    config: &OutputConfig,
    callbacks: Option<StreamCallbacks>,
) -> Result<Box<dyn BackendStream>, StreamError> {
    let mut stream = backend.open_output(config, callbacks)?;
    if let Err(err) = stream.start() {
        let _ = stream.close();
        return Err(err.into());
    }
    Ok(stream)
}

/// Render callback for callback-driven streams: fill through the bridge, apply
/// the stream volume, then report the period's status flags.
fn render_callback(
    mut invoker: FillInvoker,
    reporter: EventReporter,
    volume: Arc<Volume>,
) -> RenderCallback {
    Box::new(move |buffer, frames, flags| {
        let outcome = invoker.invoke_fill(buffer, frames);
        if outcome == Outcome::Continue {
            apply_volume(buffer, volume.get());
        } else {
            tracing::warn!(target: "bridge", "fill aborted; stopping stream");
        }
        reporter.report(flags);
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullAudioBackend;
    use pb_core::config::BridgeConfig;

    fn initialized_backend() -> NullAudioBackend {
        let mut backend = NullAudioBackend::new();
        backend.initialize().unwrap();
        backend
    }

    fn request(device: i32) -> StreamRequest {
        StreamRequest {
            device,
            sample_rate: 44_100.0,
            channels: 2,
            frames_per_buffer: 256,
        }
    }

    #[test]
    fn volume_is_clamped() {
        let volume = Volume::new();
        assert_eq!(volume.get(), 1.0);
        assert_eq!(volume.set(3.0), 2.0);
        assert_eq!(volume.set(-0.5), 0.0);
        assert_eq!(volume.set(f32::NAN), 0.0);
        assert_eq!(volume.set(0.75), 0.75);
        assert_eq!(volume.get(), 0.75);
    }

    #[test]
    fn validation_rejects_bad_requests() {
        assert!(request(0).validate(2).is_ok());
        assert!(matches!(request(-1).validate(2), Err(StreamError::InvalidArgument(_))));
        assert!(matches!(request(2).validate(2), Err(StreamError::InvalidArgument(_))));

        let bad = [
            StreamRequest { channels: 0, ..request(0) },
            StreamRequest { sample_rate: 0.0, ..request(0) },
            StreamRequest { sample_rate: f64::NAN, ..request(0) },
            StreamRequest { frames_per_buffer: 0, ..request(0) },
        ];
        for req in bad {
            assert!(matches!(req.validate(2), Err(StreamError::InvalidArgument(_))));
        }
    }

    #[test]
    fn invalid_device_message_names_the_range() {
        assert_eq!(
            request(5).validate(2).unwrap_err(),
            StreamError::invalid("Invalid device index: 5. Available devices: 0-1")
        );
        assert_eq!(
            request(0).validate(0).unwrap_err(),
            StreamError::invalid("Invalid device index: 0. No devices available")
        );
    }

    #[test]
    fn single_stream_capacity() {
        let mut backend = initialized_backend();
        let probe = backend.probe();
        let mut registry = StreamRegistry::new();

        let id = registry.open_blocking(&mut backend, request(0)).unwrap();
        assert_eq!(id, 1);
        registry.set_volume(id, 0.5).unwrap();

        let err = registry.open_blocking(&mut backend, request(1)).unwrap_err();
        assert_eq!(err, StreamError::AlreadyOpen);
        assert_eq!(registry.volume(id).unwrap(), 0.5);
        assert_eq!(probe.streams().len(), 1);
    }

    #[test]
    fn ids_are_not_reused() {
        let mut backend = initialized_backend();
        let mut registry = StreamRegistry::new();

        let first = registry.open_blocking(&mut backend, request(0)).unwrap();
        registry.take(first).unwrap().shutdown();
        let second = registry.open_blocking(&mut backend, request(0)).unwrap();
        assert!(second > first);
        assert!(matches!(registry.volume(first), Err(StreamError::NotFound(_))));
    }

    #[test]
    fn start_failure_closes_backend_stream() {
        let mut backend = initialized_backend();
        let probe = backend.probe();
        probe.fail_next_start("Device unavailable");
        let mut registry = StreamRegistry::new();

        let err = registry.open_blocking(&mut backend, request(0)).unwrap_err();
        assert_eq!(err, StreamError::Backend("Device unavailable".into()));
        assert!(registry.is_empty());
        assert_eq!(probe.open_streams(), 0);
    }

    #[test]
    fn callback_open_failure_releases_fill_binding() {
        let mut backend = initialized_backend();
        let probe = backend.probe();
        probe.fail_next_open("Invalid sample rate");
        let bridge = CallbackBridge::new(&BridgeConfig::default());
        let mut registry = StreamRegistry::new();

        let err = registry
            .open_callback_driven(
                &mut backend,
                &bridge,
                CallbackStreamOptions::default(),
                Box::new(|_, _| {}),
            )
            .unwrap_err();
        assert_eq!(err, StreamError::Backend("Invalid sample rate".into()));
        assert!(!bridge.is_fill_bound());
        assert!(registry.is_empty());
    }

    #[test]
    fn rejected_callback_options_leave_nothing_behind() {
        let mut backend = initialized_backend();
        let probe = backend.probe();
        let bridge = CallbackBridge::new(&BridgeConfig::default());
        let mut registry = StreamRegistry::new();
        let defaults = CallbackStreamOptions::default();

        let rejected = [
            CallbackStreamOptions { device: Some(2), ..defaults },
            CallbackStreamOptions { channels: 0, ..defaults },
            CallbackStreamOptions { sample_rate: f64::NAN, ..defaults },
            CallbackStreamOptions { frames_per_buffer: 0, ..defaults },
        ];
        for options in rejected {
            let err = registry
                .open_callback_driven(&mut backend, &bridge, options, Box::new(|_, _| {}))
                .unwrap_err();
            assert!(matches!(err, StreamError::InvalidArgument(_)), "{options:?}: {err:?}");
            assert!(!bridge.is_fill_bound());
        }
        assert!(probe.streams().is_empty());
        assert!(registry.is_empty());

        let devices = backend.devices().unwrap();
        probe.set_devices(devices, None);
        let err = registry
            .open_callback_driven(&mut backend, &bridge, defaults, Box::new(|_, _| {}))
            .unwrap_err();
        assert_eq!(err, StreamError::Backend("No default output device".into()));

        probe.set_devices(Vec::new(), None);
        let options = CallbackStreamOptions { device: Some(0), ..defaults };
        let err = registry
            .open_callback_driven(&mut backend, &bridge, options, Box::new(|_, _| {}))
            .unwrap_err();
        assert_eq!(err, StreamError::invalid("Invalid device index: 0. No devices available"));

        assert!(!bridge.is_fill_bound());
        assert!(probe.streams().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn callback_options_fall_back_to_device_latency() {
        let mut backend = initialized_backend();
        let probe = backend.probe();
        let bridge = CallbackBridge::new(&BridgeConfig::default());
        let mut registry = StreamRegistry::new();

        let options = CallbackStreamOptions {
            suggested_latency: Some(-1.0),
            ..CallbackStreamOptions::default()
        };
        registry
            .open_callback_driven(&mut backend, &bridge, options, Box::new(|_, _| {}))
            .unwrap();

        let record = &probe.streams()[0];
        assert!(record.callback_driven);
        assert_eq!(record.config.params.device, 0);
        assert_eq!(record.config.params.suggested_latency, 0.01);
        assert_eq!(record.config.frames_per_buffer, 256);

        for entry in registry.take_all() {
            entry.shutdown();
        }
        bridge.release();
    }
}
