//! Stream status notifications

use std::fmt;

use crate::backend::StatusFlags;
use crate::bridge::CallbackBridge;

/// Kind of stream notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    OutputUnderflow,
    OutputOverflow,
    PrimingOutput,
    /// The backend reported an asynchronous stream failure
    Error,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutputUnderflow => "outputUnderflow",
            Self::OutputOverflow => "outputOverflow",
            Self::PrimingOutput => "primingOutput",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StreamEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification delivered to the event handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    /// Empty for status flags
    pub message: String,
}

/// Flag check order; one notification per set flag
const FLAG_EVENTS: [(StatusFlags, StreamEventKind); 3] = [
    (StatusFlags::OUTPUT_UNDERFLOW, StreamEventKind::OutputUnderflow),
    (StatusFlags::OUTPUT_OVERFLOW, StreamEventKind::OutputOverflow),
    (StatusFlags::PRIMING_OUTPUT, StreamEventKind::PrimingOutput),
];

/// Forwards status observed on the real-time thread to the event handler
#[derive(Clone)]
pub struct EventReporter {
    bridge: CallbackBridge,
}

impl EventReporter {
    pub fn new(bridge: CallbackBridge) -> Self {
        Self { bridge }
    }

    /// Emit one notification per flag set in `flags`: underflow, then
    /// overflow, then priming. Never blocks.
    pub fn report(&self, flags: StatusFlags) {
        if flags.is_empty() {
            return;
        }
        for (flag, kind) in FLAG_EVENTS {
            if flags.contains(flag) {
                self.bridge.invoke_event(kind, String::new());
            }
        }
    }

    /// Emit an `error` notification carrying the backend's message
    pub fn report_error(&self, message: String) {
        self.bridge.invoke_event(StreamEventKind::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_core::config::BridgeConfig;
    use std::sync::mpsc;

    fn collect(flags_per_period: &[StatusFlags]) -> Vec<StreamEventKind> {
        let bridge = CallbackBridge::new(&BridgeConfig::default());
        let (tx, rx) = mpsc::channel();
        bridge
            .bind_events(Box::new(move |event| {
                tx.send(event.kind).unwrap();
            }))
            .unwrap();

        let reporter = EventReporter::new(bridge.clone());
        for flags in flags_per_period {
            reporter.report(*flags);
        }
        bridge.release_events();
        rx.try_iter().collect()
    }

    #[test]
    fn underflow_and_overflow_in_one_period() {
        let events = collect(&[StatusFlags::OUTPUT_OVERFLOW | StatusFlags::OUTPUT_UNDERFLOW]);
        assert_eq!(
            events,
            vec![StreamEventKind::OutputUnderflow, StreamEventKind::OutputOverflow]
        );
    }

    #[test]
    fn repeated_periods_are_not_coalesced() {
        let events = collect(&[
            StatusFlags::OUTPUT_UNDERFLOW,
            StatusFlags::empty(),
            StatusFlags::all(),
            StatusFlags::OUTPUT_UNDERFLOW,
        ]);
        assert_eq!(
            events,
            vec![
                StreamEventKind::OutputUnderflow,
                StreamEventKind::OutputUnderflow,
                StreamEventKind::OutputOverflow,
                StreamEventKind::PrimingOutput,
                StreamEventKind::OutputUnderflow,
            ]
        );
    }

    #[test]
    fn kinds_use_camel_case_names() {
        assert_eq!(StreamEventKind::PrimingOutput.to_string(), "primingOutput");
        assert_eq!(StreamEventKind::Error.as_str(), "error");
    }
}
