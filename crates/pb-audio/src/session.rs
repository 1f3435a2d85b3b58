//! Audio session
//!
//! The controller-owned object tying a backend, the stream registry and the
//! callback bridge together. Every operation takes `&self`, so a session can
//! be shared (`Arc<AudioSession>`) with fill and event handlers, which may
//! close streams from inside the handler.
//!
//! Lock order is registry, then backend. Bridge bindings are always released
//! with no session lock held, because releasing waits for the handler's worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use pb_core::config::{Config, StreamConfig};
use pb_core::{stream_debug, StreamError, StreamId};

use crate::backend::{AudioBackend, DeviceInfo, OutputParameters, FALLBACK_LATENCY};
use crate::bridge::{self, CallbackBridge, EventHandler, FillHandler};
use crate::registry::{
    CallbackStreamOptions, StreamEntry, StreamKind, StreamRegistry, StreamRequest,
};
use crate::write_path;

/// Snapshot of an open stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamStatus {
    pub id: StreamId,
    pub kind: StreamKind,
    pub channels: u16,
    pub sample_rate: f64,
    pub frames_per_buffer: u32,
    pub volume: f32,
}

/// Output streaming session
pub struct AudioSession {
    backend: Mutex<Box<dyn AudioBackend>>,
    registry: Mutex<StreamRegistry>,
    bridge: CallbackBridge,
    defaults: StreamConfig,
    initialized: AtomicBool,
}

impl AudioSession {
    /// Create a session with default configuration
    pub fn new(backend: Box<dyn AudioBackend>) -> Self {
        Self::with_config(backend, &Config::default())
    }

    pub fn with_config(backend: Box<dyn AudioBackend>, config: &Config) -> Self {
        Self {
            backend: Mutex::new(backend),
            registry: Mutex::new(StreamRegistry::new()),
            bridge: CallbackBridge::new(&config.bridge),
            defaults: config.stream.clone(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Convenience for sharing with handlers
    pub fn shared(backend: Box<dyn AudioBackend>, config: &Config) -> Arc<Self> {
        Arc::new(Self::with_config(backend, config))
    }

    /// Bring up the backend. Calling it again while initialized is a no-op.
    pub fn initialize(&self) -> Result<(), StreamError> {
        let mut backend = self.backend.lock();
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        backend.initialize()?;
        self.initialized.store(true, Ordering::Release);
        tracing::info!("Audio backend initialized: {}", backend.version_text());
        Ok(())
    }

    /// Close every stream, release both bridge bindings and terminate the
    /// backend. Idempotent.
    pub fn shutdown(&self) -> Result<(), StreamError> {
        self.close_all();
        self.bridge.release();

        let mut backend = self.backend.lock();
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        backend.shutdown()?;
        tracing::info!("Audio backend shut down");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn backend_version(&self) -> String {
        self.backend.lock().version_text()
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>, StreamError> {
        Ok(self.backend.lock().devices()?)
    }

    pub fn default_output_device(&self) -> Option<usize> {
        self.backend.lock().default_output_device()
    }

    /// Whether the device can play `f32` output at this rate and channel count
    pub fn is_output_format_supported(&self, device: usize, sample_rate: f64, channels: u16) -> bool {
        let backend = self.backend.lock();
        let suggested_latency = backend
            .device_info(device)
            .map(|info| info.default_low_output_latency)
            .unwrap_or(FALLBACK_LATENCY);
        let params = OutputParameters {
            device,
            channels,
            suggested_latency,
        };
        backend.is_output_format_supported(&params, sample_rate)
    }

    /// Open a blocking stream on the default output device with the configured
    /// defaults (stereo, 44100 Hz, 256 frames unless configured otherwise).
    pub fn open_default_stream(&self) -> Result<StreamId, StreamError> {
        let mut registry = self.registry.lock();
        registry.ensure_vacancy()?;
        let mut backend = self.backend.lock();
        let device = crate::registry::default_device(&**backend)?;
        let request = StreamRequest {
            device: i32::try_from(device).map_err(|_| StreamError::invalid("Device index out of range"))?,
            sample_rate: self.defaults.sample_rate,
            channels: self.defaults.channels,
            frames_per_buffer: self.defaults.frames_per_buffer,
        };
        registry.open_blocking(&mut **backend, request)
    }

    /// Open a blocking stream with explicit parameters
    pub fn open_stream(
        &self,
        device: i32,
        sample_rate: f64,
        channels: u16,
        frames_per_buffer: u32,
    ) -> Result<StreamId, StreamError> {
        let request = StreamRequest {
            device,
            sample_rate,
            channels,
            frames_per_buffer,
        };
        let mut registry = self.registry.lock();
        let mut backend = self.backend.lock();
        registry.open_blocking(&mut **backend, request)
    }

    /// Open a callback-driven stream whose periods are filled by `handler`.
    ///
    /// `handler` runs on the bridge's fill worker while the backend's real-time
    /// thread waits for it. Its execution time must stay well inside one buffer
    /// period or the output glitches.
    pub fn open_callback_stream(
        &self,
        options: CallbackStreamOptions,
        handler: FillHandler,
    ) -> Result<StreamId, StreamError> {
        let mut registry = self.registry.lock();
        let mut backend = self.backend.lock();
        registry.open_callback_driven(&mut **backend, &self.bridge, options, handler)
    }

    /// Callback options seeded from this session's configured defaults
    pub fn callback_options(&self) -> CallbackStreamOptions {
        CallbackStreamOptions::from_defaults(&self.defaults)
    }

    /// Write interleaved samples to a blocking stream. The stream volume is
    /// applied to `samples` in place; the frame count is the sample count
    /// divided by the stream's channel count.
    pub fn write_stream(&self, id: StreamId, samples: &mut [f32]) -> Result<(), StreamError> {
        let (stream, volume, channels) = {
            let registry = self.registry.lock();
            let entry = registry.get(id)?;
            (Arc::clone(&entry.stream), Arc::clone(&entry.volume), entry.channels)
        };
        write_path::write(&stream, &volume, samples, channels as usize)
    }

    /// Close a stream. Unknown ids are ignored. Both bridge bindings are
    /// released before the backend stream is stopped and closed.
    pub fn close_stream(&self, id: StreamId) {
        let entry = self.registry.lock().take(id);
        let Some(entry) = entry else {
            return;
        };
        self.bridge.release();
        dispose(vec![entry]);
    }

    fn close_all(&self) {
        let entries = self.registry.lock().take_all();
        if entries.is_empty() {
            return;
        }
        self.bridge.release();
        dispose(entries);
        stream_debug!("all streams closed");
    }

    /// Set the stream volume, clamped to `[0, 2]`. Returns the stored value.
    pub fn set_stream_volume(&self, id: StreamId, volume: f32) -> Result<f32, StreamError> {
        self.registry.lock().set_volume(id, volume)
    }

    pub fn stream_volume(&self, id: StreamId) -> Result<f32, StreamError> {
        self.registry.lock().volume(id)
    }

    pub fn stream_status(&self, id: StreamId) -> Result<StreamStatus, StreamError> {
        let registry = self.registry.lock();
        let entry = registry.get(id)?;
        Ok(StreamStatus {
            id,
            kind: entry.kind,
            channels: entry.channels,
            sample_rate: entry.sample_rate,
            frames_per_buffer: entry.frames_per_buffer,
            volume: entry.volume(),
        })
    }

    /// Ids of every open stream
    pub fn open_streams(&self) -> Vec<StreamId> {
        self.registry.lock().ids()
    }

    /// Replace the stream event handler
    pub fn set_stream_event_handler(&self, handler: EventHandler) -> Result<(), StreamError> {
        self.bridge.bind_events(handler)
    }

    pub fn bridge(&self) -> &CallbackBridge {
        &self.bridge
    }
}

/// Stop and close removed streams. A backend stop waits for the in-flight
/// period, which inside a fill handler is waiting on us, so teardown there
/// moves to a `pb-close` thread.
fn dispose(entries: Vec<StreamEntry>) {
    if !bridge::in_fill_handler() {
        entries.into_iter().for_each(StreamEntry::shutdown);
        return;
    }
    let ids: Vec<StreamId> = entries.iter().map(|entry| entry.id).collect();
    let spawned = thread::Builder::new()
        .name("pb-close".to_string())
        .spawn(move || entries.into_iter().for_each(StreamEntry::shutdown));
    if let Err(err) = spawned {
        tracing::error!(target: "stream", "streams {:?} left open: {}", ids, err);
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!("Audio backend shutdown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullAudioBackend;

    #[test]
    fn initialize_and_shutdown_are_idempotent() {
        let backend = NullAudioBackend::new();
        let probe = backend.probe();
        let session = AudioSession::new(Box::new(backend));

        session.initialize().unwrap();
        session.initialize().unwrap();
        assert!(probe.is_initialized());

        session.shutdown().unwrap();
        session.shutdown().unwrap();
        assert!(!probe.is_initialized());
    }

    #[test]
    fn shutdown_closes_open_streams() {
        let backend = NullAudioBackend::new();
        let probe = backend.probe();
        let session = AudioSession::new(Box::new(backend));
        session.initialize().unwrap();

        session.open_default_stream().unwrap();
        assert_eq!(probe.open_streams(), 1);

        session.shutdown().unwrap();
        assert_eq!(probe.open_streams(), 0);
        assert!(session.open_streams().is_empty());
    }

    #[test]
    fn default_stream_uses_configured_defaults() {
        let mut config = Config::default();
        config.stream.frames_per_buffer = 512;
        let backend = NullAudioBackend::new();
        let probe = backend.probe();
        let session = AudioSession::with_config(Box::new(backend), &config);
        session.initialize().unwrap();

        let id = session.open_default_stream().unwrap();
        let status = session.stream_status(id).unwrap();
        assert_eq!(status.kind, StreamKind::Blocking);
        assert_eq!(status.channels, 2);
        assert_eq!(status.frames_per_buffer, 512);
        assert_eq!(probe.streams()[0].config.sample_rate, 44_100.0);
    }

    #[test]
    fn format_support_is_forwarded() {
        let session = AudioSession::new(Box::new(NullAudioBackend::new()));
        session.initialize().unwrap();
        assert!(session.is_output_format_supported(0, 44_100.0, 2));
        assert!(!session.is_output_format_supported(0, 44_100.0, 6));
        assert!(!session.is_output_format_supported(5, 44_100.0, 2));
    }
}
