//! Observability fan-out for bus lifecycle observations.
//!
//! Observers never run on the dispatch path: observations are sent over an
//! unbounded channel to a worker task that calls each registered observer.
//! With no observers registered, emitting costs one atomic load and the
//! observation value is never constructed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::message::{CommandId, EventId, SessionId};

/// One lifecycle observation from the bus.
#[derive(Debug, Clone)]
pub enum BusObservation {
    /// A command passed admission and entered the intake queue.
    CommandAdmitted {
        /// Id of the admitted command.
        command_id: CommandId,
        /// Short type name of the command.
        command_type: &'static str,
        /// Queue depth immediately after admission.
        queue_depth: usize,
    },
    /// A command finished, successfully or not.
    CommandCompleted {
        /// Id of the completed command.
        command_id: CommandId,
        /// Short type name of the command.
        command_type: &'static str,
        /// Whether the final attempt succeeded.
        success: bool,
        /// Total attempts made.
        attempts: u32,
        /// End-to-end latency in milliseconds.
        elapsed_ms: u64,
    },
    /// A failed attempt is about to be retried.
    CommandRetried {
        /// Id of the retried command.
        command_id: CommandId,
        /// Short type name of the command.
        command_type: &'static str,
        /// Attempt number that just failed, starting at 1.
        attempt: u32,
        /// Error from the failed attempt.
        error: String,
    },
    /// A command exhausted its retries and was dead-lettered.
    CommandDeadLettered {
        /// Id of the dead-lettered command.
        command_id: CommandId,
        /// Short type name of the command.
        command_type: &'static str,
        /// Total attempts made.
        attempts: u32,
        /// Error from the final attempt.
        error: String,
    },
    /// Admission rejected a message under backpressure.
    AdmissionRejected {
        /// Short type name of the rejected message.
        message_type: &'static str,
        /// Queue capacity at rejection time.
        capacity: usize,
    },
    /// The drop-oldest policy evicted a queued message.
    MessageDropped {
        /// Short type name of the evicted message.
        message_type: &'static str,
    },
    /// An event was published into the queue.
    EventPublished {
        /// Id of the event.
        event_id: EventId,
        /// Short type name of the event.
        event_type: &'static str,
        /// Session the event belongs to, if any.
        session_id: Option<SessionId>,
    },
    /// An event completed its fan-out.
    EventDelivered {
        /// Id of the event.
        event_id: EventId,
        /// Short type name of the event.
        event_type: &'static str,
        /// Handlers that ran.
        handlers: usize,
        /// Handlers that returned an error.
        failures: usize,
    },
    /// A filter prevented a handler from seeing an event.
    EventFiltered {
        /// Id of the event.
        event_id: EventId,
        /// Short type name of the event.
        event_type: &'static str,
        /// Name of the filter that rejected it.
        filter: String,
    },
    /// An event handler returned an error.
    EventHandlerFailed {
        /// Id of the event.
        event_id: EventId,
        /// Short type name of the event.
        event_type: &'static str,
        /// Name of the failing handler.
        handler: &'static str,
        /// Error text.
        error: String,
    },
    /// A circuit breaker changed state.
    CircuitStateChanged {
        /// Command type the breaker guards.
        command_type: String,
        /// New state as a stable string (`closed`, `open`, `half_open`).
        state: &'static str,
    },
    /// A session was opened.
    SessionStarted {
        /// Id of the new session.
        session_id: SessionId,
    },
    /// A session was closed and its handlers removed.
    SessionEnded {
        /// Id of the closed session.
        session_id: SessionId,
        /// Handlers torn down with it.
        handlers_removed: usize,
    },
    /// A scheduled event became due and was re-admitted.
    ScheduleFired {
        /// Schedule id.
        schedule_id: uuid::Uuid,
        /// Short type name of the event.
        event_type: String,
        /// When the event was due.
        due_at: DateTime<Utc>,
    },
}

/// Receives observations on the fan-out worker task.
///
/// Implementations should be quick; a slow observer delays other observers
/// but never the dispatch path.
pub trait BusObserver: Send + Sync {
    /// Handle one observation.
    fn observe(&self, observation: &BusObservation);
}

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type ObserverSlot = (ObserverId, Arc<dyn BusObserver>);

/// Fan-out hub owned by the bus.
pub struct ObservabilityHub {
    observers: Arc<RwLock<Vec<ObserverSlot>>>,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<BusObservation>,
    rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<BusObservation>>>,
}

impl Default for ObservabilityHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservabilityHub {
    /// Create a hub. The worker is spawned later by [`Self::spawn_worker`]
    /// so construction does not require a runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            observers: Arc::new(RwLock::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(0),
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Register an observer.
    pub fn subscribe(&self, observer: Arc<dyn BusObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.observers.write() {
            observers.push((id, observer));
            self.active.store(observers.len(), Ordering::Relaxed);
        }
        id
    }

    /// Remove an observer. Returns true when it was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let Ok(mut observers) = self.observers.write() else {
            return false;
        };
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        self.active.store(observers.len(), Ordering::Relaxed);
        observers.len() != before
    }

    /// Emit an observation. The closure runs only when at least one
    /// observer is registered.
    pub(crate) fn emit(&self, make: impl FnOnce() -> BusObservation) {
        if self.active.load(Ordering::Relaxed) == 0 {
            return;
        }
        // Send fails only after the worker is gone, during teardown.
        let _ = self.tx.send(make());
    }

    /// Spawn the fan-out worker. Idempotent; the second call is a no-op.
    pub(crate) fn spawn_worker(&self) -> Option<JoinHandle<()>> {
        let mut rx = {
            let mut slot = self.rx.lock().ok()?;
            slot.take()?
        };
        let observers = Arc::clone(&self.observers);
        Some(tokio::spawn(async move {
            while let Some(observation) = rx.recv().await {
                let snapshot: Vec<ObserverSlot> = match observers.read() {
                    Ok(guard) => guard.clone(),
                    Err(_) => break,
                };
                for (_, observer) in &snapshot {
                    observer.observe(&observation);
                }
            }
            debug!("observability worker stopped");
        }))
    }
}

/// Observer that mirrors every observation into `tracing` at debug level.
#[derive(Default)]
pub struct TracingObserver;

impl TracingObserver {
    /// Create the observer.
    pub const fn new() -> Self {
        Self
    }
}

impl BusObserver for TracingObserver {
    fn observe(&self, observation: &BusObservation) {
        debug!(?observation, "bus observation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingObserver {
        seen: AtomicUsize,
    }

    impl BusObserver for CountingObserver {
        fn observe(&self, _observation: &BusObservation) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample() -> BusObservation {
        BusObservation::SessionStarted { session_id: SessionId::from("s") }
    }

    #[tokio::test]
    async fn emit_reaches_subscribed_observer() {
        let hub = ObservabilityHub::new();
        hub.spawn_worker();
        let observer = Arc::new(CountingObserver { seen: AtomicUsize::new(0) });
        hub.subscribe(Arc::clone(&observer) as Arc<dyn BusObserver>);

        hub.emit(sample);
        hub.emit(sample);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observer.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn emit_without_observers_skips_construction() {
        let hub = ObservabilityHub::new();
        hub.spawn_worker();
        let constructed = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&constructed);

        hub.emit(move || {
            flag.fetch_add(1, Ordering::SeqCst);
            sample()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(constructed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = ObservabilityHub::new();
        hub.spawn_worker();
        let observer = Arc::new(CountingObserver { seen: AtomicUsize::new(0) });
        let id = hub.subscribe(Arc::clone(&observer) as Arc<dyn BusObserver>);

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(sample);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observer.seen.load(Ordering::SeqCst), 0);
    }
}
