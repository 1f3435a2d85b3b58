//! Audio backends
//!
//! A backend owns the device/driver layer: global init/terminate, device
//! queries and the low-level stream primitives. Streams are always output-only
//! and carry interleaved `f32` samples.

use bitflags::bitflags;
use pb_core::BackendError;

pub mod cpal_backend;
pub mod null;

pub use cpal_backend::CpalBackend;
pub use null::{NullAudioBackend, NullProbe};

/// Latency used when the device cannot report its own (seconds)
pub const FALLBACK_LATENCY: f64 = 0.05;

/// Description of one device as reported by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub default_sample_rate: f64,
    pub host_api: usize,
    pub default_low_input_latency: f64,
    pub default_low_output_latency: f64,
    pub default_high_input_latency: f64,
    pub default_high_output_latency: f64,
}

/// Output side of a stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputParameters {
    pub device: usize,
    pub channels: u16,
    /// Suggested latency in seconds
    pub suggested_latency: f64,
}

/// Everything the backend needs to open an output stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputConfig {
    pub params: OutputParameters,
    pub sample_rate: f64,
    pub frames_per_buffer: u32,
}

bitflags! {
    /// Status observed by the backend during one render period
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u32 {
        const OUTPUT_UNDERFLOW = 1 << 0;
        const OUTPUT_OVERFLOW = 1 << 1;
        const PRIMING_OUTPUT = 1 << 2;
    }
}

/// What the backend should do after a render callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep the stream running
    Continue,
    /// Stop the stream now
    Abort,
}

/// Called on the backend's real-time thread once per buffer period with the
/// interleaved output buffer, its frame count and that period's status.
pub type RenderCallback = Box<dyn FnMut(&mut [f32], usize, StatusFlags) -> Outcome + Send + 'static>;

/// Called by the backend when the running stream fails asynchronously.
pub type ErrorCallback = Box<dyn FnMut(String) + Send + 'static>;

/// Callbacks for a callback-driven stream
pub struct StreamCallbacks {
    pub render: RenderCallback,
    pub on_error: ErrorCallback,
}

/// Device/driver layer used by the session
pub trait AudioBackend: Send {
    /// Bring up the audio subsystem
    fn initialize(&mut self) -> Result<(), BackendError>;
    /// Tear down the audio subsystem
    fn shutdown(&mut self) -> Result<(), BackendError>;
    /// Human-readable backend version
    fn version_text(&self) -> String;
    /// All devices known to the backend
    fn devices(&self) -> Result<Vec<DeviceInfo>, BackendError>;
    /// Index of the default output device, if any
    fn default_output_device(&self) -> Option<usize>;
    /// Whether `f32` output with these parameters can be opened
    fn is_output_format_supported(&self, params: &OutputParameters, sample_rate: f64) -> bool;
    /// Open (but do not start) an output stream. `callbacks` is `None` for
    /// blocking streams fed through [`BackendStream::write`].
    fn open_output(
        &mut self,
        config: &OutputConfig,
        callbacks: Option<StreamCallbacks>,
    ) -> Result<Box<dyn BackendStream>, BackendError>;

    fn device_count(&self) -> Result<usize, BackendError> {
        Ok(self.devices()?.len())
    }

    fn device_info(&self, index: usize) -> Option<DeviceInfo> {
        self.devices().ok()?.into_iter().nth(index)
    }
}

/// One native stream, exclusively owned by its registry entry
pub trait BackendStream: Send {
    fn start(&mut self) -> Result<(), BackendError>;
    fn stop(&mut self) -> Result<(), BackendError>;
    /// Release the native stream. Further calls are no-ops.
    fn close(&mut self) -> Result<(), BackendError>;
    /// Enqueue `frames` frames of interleaved samples, blocking until accepted
    fn write(&mut self, samples: &[f32], frames: usize) -> Result<(), BackendError>;
}
