//! Durable scheduling of future-dated events.
//!
//! A schedule is accepted only after its checkpoint write succeeds, so a
//! crash between acceptance and firing never loses it. The tick loop moves
//! due schedules back through normal admission; the checkpoint row is
//! deleted only once the event is handed off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{BusError, BusResult};
use crate::domain::message::{short_type_name, Event, EventEnvelope};
use crate::services::checkpoint::{ScheduledEventRecord, ScheduledStore};
use crate::services::observability::{BusObservation, ObservabilityHub};
use crate::services::resilience::{BusMessage, ResilienceLayer};

type Rehydrator = Arc<dyn Fn(&ScheduledEventRecord) -> BusResult<EventEnvelope> + Send + Sync>;

struct PendingSchedule {
    id: Uuid,
    due_at: DateTime<Utc>,
    event_type: String,
    envelope: EventEnvelope,
}

/// Tick-driven scheduler bridging a checkpoint store and the bus.
pub(crate) struct EventScheduler {
    store: RwLock<Option<Arc<dyn ScheduledStore>>>,
    pending: RwLock<Vec<PendingSchedule>>,
    rehydrators: RwLock<HashMap<String, Rehydrator>>,
    tick_interval: Duration,
    hub: Arc<ObservabilityHub>,
    running: Arc<AtomicBool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventScheduler {
    pub(crate) fn new(tick_interval: Duration, hub: Arc<ObservabilityHub>) -> Self {
        Self {
            store: RwLock::new(None),
            pending: RwLock::new(Vec::new()),
            rehydrators: RwLock::new(HashMap::new()),
            tick_interval,
            hub,
            running: Arc::new(AtomicBool::new(false)),
            worker: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn set_store(&self, store: Arc<dyn ScheduledStore>) {
        if let Ok(mut slot) = self.store.try_write() {
            *slot = Some(store);
        }
    }

    async fn store(&self) -> Option<Arc<dyn ScheduledStore>> {
        self.store.read().await.clone()
    }

    /// Accept a schedule. With a store attached, the checkpoint write must
    /// succeed before the schedule exists anywhere else.
    pub(crate) async fn schedule<E>(&self, event: E, due_at: DateTime<Utc>) -> BusResult<Uuid>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(&event).map_err(|err| BusError::ScheduleCodec {
            event_type: short_type_name::<E>().to_string(),
            reason: err.to_string(),
        })?;
        let envelope = EventEnvelope::new(event);
        let record = ScheduledEventRecord {
            id: Uuid::new_v4(),
            event_type: envelope.event_type.to_string(),
            payload,
            session_id: envelope.session_id.clone(),
            due_at,
            created_at: Utc::now(),
        };
        if let Some(store) = self.store().await {
            store.save(&record).await?;
        }
        debug!(
            schedule_id = %record.id,
            event_type = %record.event_type,
            due_at = %due_at,
            "event scheduled"
        );
        self.pending.write().await.push(PendingSchedule {
            id: record.id,
            due_at,
            event_type: record.event_type,
            envelope,
        });
        Ok(record.id)
    }

    /// Register a deserializer so checkpointed schedules of this event
    /// type can be rebuilt after a restart.
    pub(crate) async fn register_scheduled_type<E>(&self)
    where
        E: Event + DeserializeOwned,
    {
        let rehydrator: Rehydrator = Arc::new(|record: &ScheduledEventRecord| {
            let event: E =
                serde_json::from_value(record.payload.clone()).map_err(|err| {
                    BusError::ScheduleCodec {
                        event_type: record.event_type.clone(),
                        reason: err.to_string(),
                    }
                })?;
            Ok(EventEnvelope::new(event))
        });
        self.rehydrators
            .write()
            .await
            .insert(short_type_name::<E>().to_string(), rehydrator);
    }

    /// Rebuild pending schedules from the checkpoint store. Rows whose
    /// event type has no registered rehydrator stay persisted and are
    /// skipped with a warning. Past-due schedules fire on the first tick.
    pub(crate) async fn restore(&self) -> BusResult<usize> {
        let Some(store) = self.store().await else {
            return Ok(0);
        };
        let records = store.load_all().await?;
        let rehydrators = self.rehydrators.read().await;
        let mut pending = self.pending.write().await;
        let mut restored = 0;
        for record in records {
            if pending.iter().any(|p| p.id == record.id) {
                continue;
            }
            let Some(rehydrate) = rehydrators.get(&record.event_type) else {
                warn!(
                    schedule_id = %record.id,
                    event_type = %record.event_type,
                    "no rehydrator registered for checkpointed event type"
                );
                continue;
            };
            match rehydrate(&record) {
                Ok(envelope) => {
                    pending.push(PendingSchedule {
                        id: record.id,
                        due_at: record.due_at,
                        event_type: record.event_type,
                        envelope,
                    });
                    restored += 1;
                }
                Err(err) => {
                    warn!(
                        schedule_id = %record.id,
                        error = %err,
                        "failed to rehydrate checkpointed schedule"
                    );
                }
            }
        }
        Ok(restored)
    }

    /// Cancel a pending schedule and delete its checkpoint row.
    pub(crate) async fn cancel(&self, schedule_id: Uuid) -> BusResult<()> {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|p| p.id != schedule_id);
        let found = pending.len() != before;
        drop(pending);
        if let Some(store) = self.store().await {
            store.delete(schedule_id).await?;
        }
        if found {
            debug!(schedule_id = %schedule_id, "schedule cancelled");
            Ok(())
        } else {
            Err(BusError::ScheduleNotFound(schedule_id))
        }
    }

    /// Number of schedules waiting to fire.
    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Spawn the tick loop, publishing due events through admission.
    pub(crate) fn start(self: &Arc<Self>, resilience: Arc<ResilienceLayer>) {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = Arc::clone(self);
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                scheduler.fire_due(&resilience).await;
            }
            debug!("scheduler stopped");
        });
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(handle);
        }
    }

    async fn fire_due(&self, resilience: &Arc<ResilienceLayer>) {
        let now = Utc::now();
        let due: Vec<PendingSchedule> = {
            let mut pending = self.pending.write().await;
            let mut still = Vec::with_capacity(pending.len());
            let mut due = Vec::new();
            for item in pending.drain(..) {
                if item.due_at <= now {
                    due.push(item);
                } else {
                    still.push(item);
                }
            }
            *pending = still;
            due
        };
        for item in due {
            info!(
                schedule_id = %item.id,
                event_type = %item.event_type,
                "scheduled event due, publishing"
            );
            let envelope = item.envelope.clone();
            match resilience.admit(BusMessage::Event { envelope, responder: None }).await {
                Ok(()) => {
                    if let Some(store) = self.store().await {
                        if let Err(err) = store.delete(item.id).await {
                            warn!(
                                schedule_id = %item.id,
                                error = %err,
                                "failed to delete checkpoint row"
                            );
                        }
                    }
                    let schedule_id = item.id;
                    let event_type = item.event_type;
                    let due_at = item.due_at;
                    self.hub.emit(|| BusObservation::ScheduleFired {
                        schedule_id,
                        event_type,
                        due_at,
                    });
                }
                Err(err) => {
                    warn!(
                        schedule_id = %item.id,
                        error = %err,
                        "due scheduled event not admitted, retrying next tick"
                    );
                    self.pending.write().await.push(item);
                }
            }
        }
    }

    /// Stop the tick loop. Schedules stay pending and fire after a
    /// restart when a store is attached.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
