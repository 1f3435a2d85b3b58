//! Audio output streaming for pulsebridge
//!
//! An [`AudioSession`] owns the audio backend, a registry of open output
//! streams and the [`CallbackBridge`] that lets a controller-side handler fill
//! buffers requested by the backend's real-time thread.

pub mod backend;
pub mod bridge;
pub mod events;
pub mod registry;
pub mod session;
pub mod write_path;

pub use backend::{
    AudioBackend, BackendStream, CpalBackend, DeviceInfo, NullAudioBackend, NullProbe, Outcome,
    StatusFlags,
};
pub use bridge::{CallbackBridge, EventHandler, FillHandler, FillInfo, FillInvoker};
pub use events::{EventReporter, StreamEvent, StreamEventKind};
pub use registry::{CallbackStreamOptions, StreamKind, StreamRegistry, StreamRequest, Volume};
pub use session::{AudioSession, StreamStatus};
