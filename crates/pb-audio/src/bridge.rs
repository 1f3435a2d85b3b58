//! Cross-thread callback bridge
//!
//! The real-time render thread cannot run controller logic itself, so each
//! direction of the bridge owns a worker thread that runs the controller's
//! handler:
//!
//! - **fill**: a blocking rendezvous. The real-time side sends a scratch
//!   buffer over a bounded channel, the fill worker runs the handler on it and
//!   sends it back, and the real-time side copies it into the device buffer.
//!   The scratch buffer travels back and forth, so steady-state periods do not
//!   allocate.
//! - **event**: fire-and-forget. Notifications go into a bounded queue and the
//!   real-time side never waits for delivery.
//!
//! The fill handler runs while the real-time thread is suspended. Its
//! execution time comes straight out of the period budget: a slow handler
//! produces audible glitches, not crashes.
//!
//! Each direction is either unbound or bound. Binding replaces (and releases)
//! the previous handler; releasing is safe at any time, including while a fill
//! is in flight. An in-flight fill completes, and any fill that starts after
//! the release returns [`Outcome::Abort`].

use std::cell::Cell;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use pb_core::config::BridgeConfig;
use pb_core::{bridge_debug, bridge_trace, StreamError};

use crate::backend::Outcome;
use crate::events::{StreamEvent, StreamEventKind};

thread_local! {
    static IN_FILL_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is running a fill handler
pub fn in_fill_handler() -> bool {
    IN_FILL_WORKER.with(Cell::get)
}

/// Shape of the buffer handed to a fill handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillInfo {
    /// Frames requested this period
    pub frames: usize,
    /// Interleaved channels per frame
    pub channels: u16,
}

/// Controller-side handler that fills one period of interleaved samples.
/// The buffer arrives zeroed.
pub type FillHandler = Box<dyn FnMut(&mut [f32], FillInfo) + Send + 'static>;

/// Controller-side handler for stream notifications
pub type EventHandler = Box<dyn FnMut(&StreamEvent) + Send + 'static>;

struct FillRequest {
    seq: u64,
    frames: usize,
    buffer: Vec<f32>,
}

struct FillReply {
    seq: u64,
    buffer: Vec<f32>,
    completed: bool,
}

struct FillBinding {
    requests: Sender<FillRequest>,
    replies: Receiver<FillReply>,
    channels: u16,
    worker: Option<JoinHandle<()>>,
}

struct EventBinding {
    queue: Sender<StreamEvent>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BridgeStats {
    fills: AtomicU64,
    aborts: AtomicU64,
    dropped_events: AtomicU64,
}

struct BridgeShared {
    fill: Mutex<Option<FillBinding>>,
    events: Mutex<Option<EventBinding>>,
    stats: BridgeStats,
    fill_timeout: Option<Duration>,
    event_capacity: usize,
}

/// Fill and event bindings for one session. Cloning shares the bindings.
#[derive(Clone)]
pub struct CallbackBridge {
    shared: Arc<BridgeShared>,
}

impl CallbackBridge {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            shared: Arc::new(BridgeShared {
                fill: Mutex::new(None),
                events: Mutex::new(None),
                stats: BridgeStats::default(),
                fill_timeout: config.fill_timeout(),
                event_capacity: config.event_queue_capacity.max(1),
            }),
        }
    }

    /// Bind `handler` as the fill endpoint, releasing any previous one first.
    pub fn bind_fill(&self, handler: FillHandler, channels: u16) -> Result<(), StreamError> {
        self.release_fill();

        let (requests, request_rx) = channel::bounded::<FillRequest>(1);
        let (reply_tx, replies) = channel::bounded::<FillReply>(1);
        let worker = thread::Builder::new()
            .name("pb-fill".to_string())
            .spawn(move || fill_worker(handler, channels, request_rx, reply_tx))
            .map_err(|err| StreamError::Backend(format!("failed to spawn fill worker: {err}")))?;

        *self.shared.fill.lock() = Some(FillBinding {
            requests,
            replies,
            channels,
            worker: Some(worker),
        });
        bridge_debug!("fill handler bound ({} channels)", channels);
        Ok(())
    }

    /// Bind `handler` as the event endpoint, releasing any previous one first.
    pub fn bind_events(&self, handler: EventHandler) -> Result<(), StreamError> {
        self.release_events();

        let (queue, event_rx) = channel::bounded::<StreamEvent>(self.shared.event_capacity);
        let worker = thread::Builder::new()
            .name("pb-events".to_string())
            .spawn(move || event_worker(handler, event_rx))
            .map_err(|err| StreamError::Backend(format!("failed to spawn event worker: {err}")))?;

        *self.shared.events.lock() = Some(EventBinding {
            queue,
            worker: Some(worker),
        });
        bridge_debug!("event handler bound");
        Ok(())
    }

    pub fn is_fill_bound(&self) -> bool {
        self.shared.fill.lock().is_some()
    }

    pub fn is_events_bound(&self) -> bool {
        self.shared.events.lock().is_some()
    }

    /// Drop the fill binding. No fill starts after this returns; one already
    /// dispatched runs to completion first.
    pub fn release_fill(&self) {
        let binding = self.shared.fill.lock().take();
        if let Some(mut binding) = binding {
            let worker = binding.worker.take();
            drop(binding);
            join_worker(worker);
            bridge_debug!("fill handler released");
        }
    }

    /// Drop the event binding. Notifications already queued are delivered
    /// before the worker exits.
    pub fn release_events(&self) {
        let binding = self.shared.events.lock().take();
        if let Some(mut binding) = binding {
            let worker = binding.worker.take();
            drop(binding);
            join_worker(worker);
            bridge_debug!("event handler released");
        }
    }

    /// Drop both bindings
    pub fn release(&self) {
        self.release_fill();
        self.release_events();
    }

    /// Real-time side of the fill direction. `scratch_capacity` is the number
    /// of samples to pre-allocate, normally frames per buffer times channels.
    pub fn fill_invoker(&self, scratch_capacity: usize) -> FillInvoker {
        FillInvoker {
            shared: Arc::clone(&self.shared),
            scratch: Vec::with_capacity(scratch_capacity),
            seq: 0,
        }
    }

    /// Queue a notification for the event handler without waiting. A no-op
    /// when no handler is bound.
    pub fn invoke_event(&self, kind: StreamEventKind, message: String) {
        // Binding and releasing hold the lock only to swap the slot.
        let Some(slot) = self.shared.events.try_lock() else {
            self.shared.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(binding) = slot.as_ref() else {
            return;
        };
        match binding.queue.try_send(StreamEvent { kind, message }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Fills that completed with `Continue`
    pub fn fills_completed(&self) -> u64 {
        self.shared.stats.fills.load(Ordering::Relaxed)
    }

    /// Fills that returned `Abort`
    pub fn fills_aborted(&self) -> u64 {
        self.shared.stats.aborts.load(Ordering::Relaxed)
    }

    /// Notifications that could not be queued
    pub fn events_dropped(&self) -> u64 {
        self.shared.stats.dropped_events.load(Ordering::Relaxed)
    }
}

/// Handle the real-time thread uses to request fills
pub struct FillInvoker {
    shared: Arc<BridgeShared>,
    scratch: Vec<f32>,
    seq: u64,
}

impl FillInvoker {
    /// Hand `buffer` to the controller's fill handler and wait for it to be
    /// filled. Blocks the calling thread for as long as the handler runs
    /// (bounded by the configured fill timeout, if any).
    ///
    /// Returns [`Outcome::Abort`] when no handler is bound, when the binding is
    /// torn down mid-call, when the handler panics, or on timeout. On abort the
    /// buffer is left silent.
    pub fn invoke_fill(&mut self, buffer: &mut [f32], frames: usize) -> Outcome {
        let outcome = self.rendezvous(buffer, frames);
        match outcome {
            Outcome::Continue => {
                self.shared.stats.fills.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Abort => {
                buffer.fill(0.0);
                self.shared.stats.aborts.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    fn rendezvous(&mut self, buffer: &mut [f32], frames: usize) -> Outcome {
        let (requests, replies, channels) = {
            let slot = self.shared.fill.lock();
            match slot.as_ref() {
                Some(binding) => (
                    binding.requests.clone(),
                    binding.replies.clone(),
                    binding.channels,
                ),
                None => return Outcome::Abort,
            }
        };

        self.seq = self.seq.wrapping_add(1);
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();
        scratch.resize(frames * channels as usize, 0.0);

        let request = FillRequest {
            seq: self.seq,
            frames,
            buffer: scratch,
        };
        let deadline = self.shared.fill_timeout.map(|timeout| Instant::now() + timeout);
        // The worker may still be busy with a request that already timed out.
        let sent = match deadline {
            Some(deadline) => requests.send_deadline(request, deadline).is_ok(),
            None => requests.send(request).is_ok(),
        };
        if !sent {
            return Outcome::Abort;
        }

        loop {
            let reply = match deadline {
                Some(deadline) => replies.recv_deadline(deadline),
                None => replies.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => {
                    bridge_debug!("fill {} timed out", self.seq);
                    return Outcome::Abort;
                }
                Err(RecvTimeoutError::Disconnected) => return Outcome::Abort,
            };

            // A reply to an earlier, timed-out request; keep its buffer and wait on.
            if reply.seq != self.seq {
                self.scratch = reply.buffer;
                continue;
            }

            self.scratch = reply.buffer;
            if !reply.completed {
                return Outcome::Abort;
            }
            let filled = buffer.len().min(self.scratch.len());
            buffer[..filled].copy_from_slice(&self.scratch[..filled]);
            buffer[filled..].fill(0.0);
            return Outcome::Continue;
        }
    }
}

fn fill_worker(
    mut handler: FillHandler,
    channels: u16,
    requests: Receiver<FillRequest>,
    replies: Sender<FillReply>,
) {
    IN_FILL_WORKER.with(|flag| flag.set(true));
    // Runs until every sender is gone: the binding's and any in-flight invoker's.
    while let Ok(FillRequest { seq, frames, mut buffer }) = requests.recv() {
        let info = FillInfo { frames, channels };
        let completed =
            panic::catch_unwind(AssertUnwindSafe(|| handler(&mut buffer, info))).is_ok();
        if !completed {
            tracing::error!(target: "bridge", "fill handler panicked; aborting stream");
        }
        if replies.send(FillReply { seq, buffer, completed }).is_err() {
            break;
        }
    }
    bridge_trace!("fill worker exiting");
}

fn event_worker(mut handler: EventHandler, events: Receiver<StreamEvent>) {
    while let Ok(event) = events.recv() {
        if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
            tracing::error!(target: "bridge", "event handler panicked on {}", event.kind);
        }
    }
    bridge_trace!("event worker exiting");
}

fn join_worker(worker: Option<JoinHandle<()>>) {
    let Some(worker) = worker else {
        return;
    };
    // A handler may release its own binding (closing the stream from inside
    // the handler); that worker exits once the handler returns.
    if worker.thread().id() == thread::current().id() {
        return;
    }
    let _ = worker.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn bridge() -> CallbackBridge {
        CallbackBridge::new(&BridgeConfig::default())
    }

    #[test]
    fn unbound_fill_aborts() {
        let bridge = bridge();
        let mut invoker = bridge.fill_invoker(8);
        let mut buffer = vec![1.0f32; 8];
        assert_eq!(invoker.invoke_fill(&mut buffer, 4), Outcome::Abort);
        assert_eq!(buffer, vec![0.0; 8]);
        assert_eq!(bridge.fills_aborted(), 1);
    }

    #[test]
    fn fill_round_trips_through_worker() {
        let bridge = bridge();
        bridge
            .bind_fill(
                Box::new(|buffer, info| {
                    assert_eq!(buffer.len(), info.frames * info.channels as usize);
                    for (i, sample) in buffer.iter_mut().enumerate() {
                        *sample = i as f32;
                    }
                }),
                2,
            )
            .unwrap();

        let mut invoker = bridge.fill_invoker(8);
        let mut buffer = vec![0.0f32; 8];
        assert_eq!(invoker.invoke_fill(&mut buffer, 4), Outcome::Continue);
        assert_eq!(buffer, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(bridge.fills_completed(), 1);
    }

    #[test]
    fn fill_after_release_never_reaches_handler() {
        let bridge = bridge();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bridge
            .bind_fill(
                Box::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                2,
            )
            .unwrap();

        let mut invoker = bridge.fill_invoker(4);
        let mut buffer = vec![0.0f32; 4];
        assert_eq!(invoker.invoke_fill(&mut buffer, 2), Outcome::Continue);

        bridge.release();
        assert!(!bridge.is_fill_bound());
        assert_eq!(invoker.invoke_fill(&mut buffer, 2), Outcome::Abort);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rebind_replaces_previous_handler() {
        let bridge = bridge();
        bridge.bind_fill(Box::new(|buffer, _| buffer.fill(1.0)), 1).unwrap();
        bridge.bind_fill(Box::new(|buffer, _| buffer.fill(2.0)), 1).unwrap();

        let mut invoker = bridge.fill_invoker(2);
        let mut buffer = vec![0.0f32; 2];
        assert_eq!(invoker.invoke_fill(&mut buffer, 2), Outcome::Continue);
        assert_eq!(buffer, vec![2.0, 2.0]);
    }

    #[test]
    fn release_waits_for_in_flight_fill() {
        let bridge = bridge();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        bridge
            .bind_fill(
                Box::new(move |buffer, _| {
                    entered_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                    buffer.fill(0.5);
                }),
                1,
            )
            .unwrap();

        let mut invoker = bridge.fill_invoker(2);
        let rt = thread::spawn(move || {
            let mut buffer = vec![0.0f32; 2];
            let outcome = invoker.invoke_fill(&mut buffer, 2);
            let late = invoker.invoke_fill(&mut buffer, 2);
            (outcome, late)
        });

        entered_rx.recv().unwrap();
        let releaser = {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.release_fill())
        };
        while bridge.is_fill_bound() {
            thread::yield_now();
        }
        resume_tx.send(()).unwrap();
        releaser.join().unwrap();

        let (outcome, late) = rt.join().unwrap();
        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(late, Outcome::Abort);
    }

    #[test]
    fn panicking_handler_aborts() {
        let bridge = bridge();
        bridge.bind_fill(Box::new(|_, _| panic!("boom")), 2).unwrap();
        let mut invoker = bridge.fill_invoker(4);
        let mut buffer = vec![0.0f32; 4];
        assert_eq!(invoker.invoke_fill(&mut buffer, 2), Outcome::Abort);
        bridge.release();
    }

    #[test]
    fn slow_handler_times_out_when_bounded() {
        let config = BridgeConfig {
            fill_timeout_ms: Some(20),
            ..BridgeConfig::default()
        };
        let bridge = CallbackBridge::new(&config);
        bridge
            .bind_fill(
                Box::new(|_, _| thread::sleep(Duration::from_millis(200))),
                1,
            )
            .unwrap();
        let mut invoker = bridge.fill_invoker(1);
        let mut buffer = vec![0.0f32; 1];
        assert_eq!(invoker.invoke_fill(&mut buffer, 1), Outcome::Abort);
        drop(invoker);
        bridge.release();
    }

    #[test]
    fn events_are_delivered_in_order() {
        let bridge = bridge();
        let (tx, rx) = mpsc::channel();
        bridge
            .bind_events(Box::new(move |event| {
                tx.send(event.clone()).unwrap();
            }))
            .unwrap();

        bridge.invoke_event(StreamEventKind::OutputUnderflow, String::new());
        bridge.invoke_event(StreamEventKind::Error, "device lost".to_string());
        bridge.release_events();

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].kind, StreamEventKind::OutputUnderflow);
        assert_eq!(received[1].message, "device lost");
    }

    #[test]
    fn unbound_events_are_silent() {
        let bridge = bridge();
        bridge.invoke_event(StreamEventKind::OutputOverflow, String::new());
        assert_eq!(bridge.events_dropped(), 0);
        bridge.release();
        bridge.release();
    }
}
