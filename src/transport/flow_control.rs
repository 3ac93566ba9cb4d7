//! Per-connection backpressure signalling.
//!
//! [`FlowControl`] wraps the connection's direct outbound handle and emits
//! `PAUSE` / `RESUME` / `ACK` / `SLOW_DOWN` frames. Signals are sent only
//! when the handle is present and open; otherwise they are dropped, never
//! buffered. A consumer that reconnects gets a fresh controller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use super::protocol::{FlowMetadata, ServerMessage};

/// Direct outbound channel feeding a connection's writer task.
pub type OutboundHandle = mpsc::Sender<ServerMessage>;

/// Shortest batched-ack flush period; shorter intervals are raised to it.
pub const MIN_ACK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct FlowState {
    socket: Option<OutboundHandle>,
    paused: bool,
    pending_ack_count: u64,
    disposed: bool,
}

impl FlowState {
    /// Hand `message` to the transport if it is ready.
    fn emit(&self, message: ServerMessage) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };
        if socket.is_closed() {
            return false;
        }
        match socket.try_send(message) {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, "flow control signal dropped");
                false
            }
        }
    }

    fn flush_acks(&mut self) -> bool {
        if self.pending_ack_count == 0 {
            return false;
        }
        let count = std::mem::take(&mut self.pending_ack_count);
        self.emit(ServerMessage::Ack {
            metadata: FlowMetadata {
                ack_count: Some(count),
                ..FlowMetadata::default()
            },
        })
    }
}

/// Backpressure controller for one connection.
#[derive(Debug)]
pub struct FlowControl {
    state: Arc<Mutex<FlowState>>,
    auto_ack: bool,
    cancel: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl FlowControl {
    /// Controller that sends one `ACK` per [`acknowledge`](Self::acknowledge) call.
    #[must_use]
    pub fn new(socket: Option<OutboundHandle>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FlowState {
                socket,
                paused: false,
                pending_ack_count: 0,
                disposed: false,
            })),
            auto_ack: false,
            cancel: CancellationToken::new(),
            flush_task: Mutex::new(None),
        }
    }

    /// Controller that batches acknowledgments and flushes them every
    /// `interval` on a task owned by this instance.
    ///
    /// `interval` is raised to at least [`MIN_ACK_INTERVAL`]. Outside a
    /// tokio runtime no timer is armed; pending acks are then flushed only
    /// by [`dispose`](Self::dispose).
    #[must_use]
    pub fn with_auto_ack(socket: Option<OutboundHandle>, interval: Duration) -> Self {
        let interval = interval.max(MIN_ACK_INTERVAL);
        let mut flow = Self::new(socket);
        flow.auto_ack = true;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let state = Arc::clone(&flow.state);
                let cancel = flow.cancel.clone();
                let task = runtime.spawn(
                    async move {
                        let mut ticker = tokio::time::interval(interval);
                        loop {
                            tokio::select! {
                                () = cancel.cancelled() => break,
                                _ = ticker.tick() => {
                                    lock_state(&state).flush_acks();
                                }
                            }
                        }
                    }
                    .instrument(info_span!("ack_flush")),
                );
                *flow
                    .flush_task
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(task);
            }
            Err(_) => {
                warn!("no tokio runtime; batched acks flush only on dispose");
            }
        }

        flow
    }

    /// Emit `PAUSE` unless already paused. Returns whether a frame was sent.
    ///
    /// The controller counts as paused even when the frame is dropped, so
    /// the next [`resume`](Self::resume) may reach a consumer that never saw
    /// the `PAUSE`.
    pub fn pause(&self, queue_depth: Option<usize>) -> bool {
        let mut state = self.lock();
        if state.disposed || state.paused {
            return false;
        }
        state.paused = true;
        state.emit(ServerMessage::Pause {
            metadata: FlowMetadata {
                queue_depth,
                ..FlowMetadata::default()
            },
        })
    }

    /// Emit `RESUME` only if paused. Returns whether a frame was sent.
    pub fn resume(&self) -> bool {
        let mut state = self.lock();
        if state.disposed || !state.paused {
            return false;
        }
        state.paused = false;
        state.emit(ServerMessage::Resume {
            metadata: FlowMetadata::default(),
        })
    }

    /// Acknowledge `count` processed commands.
    ///
    /// Immediate mode sends an `ACK` now; batched mode accumulates the count
    /// for the next flush and returns `false`.
    pub fn acknowledge(&self, count: u64) -> bool {
        let mut state = self.lock();
        if state.disposed || count == 0 {
            return false;
        }
        if self.auto_ack {
            state.pending_ack_count += count;
            return false;
        }
        state.emit(ServerMessage::Ack {
            metadata: FlowMetadata {
                ack_count: Some(count),
                ..FlowMetadata::default()
            },
        })
    }

    /// Emit an advisory `SLOW_DOWN`.
    pub fn slow_down(&self, suggested_rate: u32, queue_depth: usize) -> bool {
        let state = self.lock();
        if state.disposed {
            return false;
        }
        state.emit(ServerMessage::SlowDown {
            metadata: FlowMetadata {
                queue_depth: Some(queue_depth),
                suggested_rate: Some(suggested_rate),
                ..FlowMetadata::default()
            },
        })
    }

    /// Flush batched acknowledgments now.
    pub fn flush(&self) -> bool {
        let mut state = self.lock();
        if state.disposed {
            return false;
        }
        state.flush_acks()
    }

    /// Swap the transport; `None` silences all further signals.
    pub fn set_socket(&self, socket: Option<OutboundHandle>) {
        self.lock().socket = socket;
    }

    /// Flush pending acks, stop the timer, and make the controller inert.
    pub fn dispose(&self) {
        {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.flush_acks();
            state.disposed = true;
            state.socket = None;
        }
        self.cancel.cancel();
        if let Some(task) = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// Whether a `PAUSE` is outstanding.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Acknowledgments waiting for the next batched flush.
    #[must_use]
    pub fn pending_ack_count(&self) -> u64 {
        self.lock().pending_ack_count
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        lock_state(&self.state)
    }
}

impl Drop for FlowControl {
    /// Stop the flush task when the controller is discarded.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock_state(state: &Mutex<FlowState>) -> MutexGuard<'_, FlowState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
