//! Typed event bus for pool and server notifications.
//!
//! Events are queued on a bounded channel and delivered to listeners by a
//! dedicated dispatcher thread, so emitting never blocks a job. When the queue
//! is full the event is dropped and counted.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::worker::WorkerInfo;

/// Default capacity of the event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    ServerStart,
    ServerStop,
    PoolCreate,
    PoolDestroy,
    WorkerCreate,
    WorkerDestruct,
    WorkerError,
    WorkerStderr,
    WorkerRecycle,
    PoolError,
    Error,
}

/// Payload attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventContext {
    None,
    Worker(WorkerInfo),
    WorkerError { worker: WorkerInfo, error: String },
    Error { message: String },
    Stderr { pid: u32, output: String },
}

/// A single notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Monotonic per-bus sequence number, starting at 1.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub context: EventContext,
}

/// Receives events on the dispatcher thread.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

type Listeners = Arc<RwLock<Vec<Arc<dyn Listener>>>>;

struct BusInner {
    tx: Option<Sender<Event>>,
    listeners: Listeners,
    seq: AtomicU64,
    dropped: Arc<AtomicU64>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // Closing the sender ends the dispatcher loop once the queue drains.
        self.tx.take();
        let handle = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

/// Cloneable handle to a shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus whose queue holds at most `capacity` pending events.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let dropped = Arc::new(AtomicU64::new(0));

        let dispatcher = {
            let listeners = Arc::clone(&listeners);
            std::thread::Builder::new()
                .name("event-dispatch".to_string())
                .spawn(move || dispatch(rx, listeners))
        };
        let dispatcher = match dispatcher {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to start event dispatcher; events will be dropped");
                None
            }
        };

        Self {
            inner: Arc::new(BusInner {
                tx: dispatcher.as_ref().map(|_| tx),
                listeners,
                seq: AtomicU64::new(0),
                dropped,
                dispatcher: Mutex::new(dispatcher),
            }),
        }
    }

    /// Register a listener. It sees events emitted after registration.
    pub fn add_listener(&self, listener: impl Listener + 'static) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Queue an event for delivery. Never blocks.
    pub fn emit(&self, kind: EventKind, context: EventContext) {
        let event = Event {
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1,
            at: Utc::now(),
            kind,
            context,
        };

        let Some(tx) = &self.inner.tx else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(kind = ?event.kind, dropped = total, "Event queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

fn dispatch(rx: Receiver<Event>, listeners: Listeners) {
    for event in rx {
        let current: Vec<Arc<dyn Listener>> = listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in current {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                error!(seq = event.seq, kind = ?event.kind, "Event listener panicked");
            }
        }
    }
}

/// Listener that mirrors events into `tracing`.
pub fn log_listener() -> impl Listener {
    |event: &Event| match (&event.kind, &event.context) {
        (EventKind::WorkerStderr, EventContext::Stderr { pid, output }) => {
            info!(target: "relayvisor::worker", pid, "{}", output.trim_end());
        }
        (EventKind::WorkerError, EventContext::WorkerError { worker, error }) => {
            warn!(pid = worker.pid, error = %error, "Worker error");
        }
        (EventKind::PoolError | EventKind::Error, EventContext::Error { message }) => {
            warn!(kind = ?event.kind, "{}", message);
        }
        (kind, EventContext::Worker(worker)) => {
            debug!(kind = ?kind, pid = worker.pid, state = %worker.state, jobs = worker.jobs, "Worker event");
        }
        (kind, _) => {
            debug!(kind = ?kind, seq = event.seq, "Event");
        }
    }
}
