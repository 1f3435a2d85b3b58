//! Blocking write path
//!
//! Push-model data path for blocking streams. Volume is applied to the
//! caller's buffer in place before it is handed to the backend, so after a
//! write the caller's samples hold the scaled values.

use pb_core::{stream_trace, StreamError};

use crate::registry::{SharedStream, Volume};

/// Scale `samples` by `volume` in place. Unity gain leaves them untouched.
#[inline]
pub fn apply_volume(samples: &mut [f32], volume: f32) {
    if volume == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        *sample *= volume;
    }
}

/// Scale `samples` by the stream's current volume and write
/// `samples.len() / frame_divisor` frames to the backend. May block until the
/// backend accepts the data; never call from the real-time thread.
pub fn write(
    stream: &SharedStream,
    volume: &Volume,
    samples: &mut [f32],
    frame_divisor: usize,
) -> Result<(), StreamError> {
    if samples.is_empty() {
        return Err(StreamError::invalid("Empty buffer"));
    }
    if frame_divisor == 0 {
        return Err(StreamError::invalid("Frame divisor must be positive"));
    }

    apply_volume(samples, volume.get());
    let frames = samples.len() / frame_divisor;
    stream_trace!("writing {} frames", frames);
    stream.lock().write(samples, frames)?;
    Ok(())
}
