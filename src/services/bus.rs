//! The message bus facade and the core dispatch pipeline.
//!
//! [`MessageBus`] is the handle applications hold: registration, execute,
//! publish, sessions, scheduling, and lifecycle all hang off it. Dispatch
//! itself lives in [`DispatchCore`]: resolve the handler, thread the command
//! through middleware, fan events out tier by tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::domain::errors::{BusError, BusResult};
use crate::domain::message::{
    Command, CommandEnvelope, CommandId, CommandResult, Event, EventEnvelope, HandlerScope,
    SessionId,
};
use crate::domain::queue::IntakeQueue;
use crate::services::checkpoint::{EventLog, EventLogEntry, ScheduledStore};
use crate::services::circuit_breaker::{CircuitBreakerService, CircuitState};
use crate::services::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use crate::services::filters::EventFilter;
use crate::services::middleware::{
    run_chain, run_event_chain, CommandMiddleware, EventMiddleware, EventTerminal, Terminal,
};
use crate::services::observability::{BusObservation, BusObserver, ObservabilityHub, ObserverId};
use crate::services::registry::{
    CommandHandler, EventHandler, HandlerId, HandlerPriority, HandlerRegistry,
};
use crate::services::resilience::{BusMessage, ResilienceLayer};
use crate::services::scheduler::EventScheduler;
use crate::services::session::{SessionEndEvent, SessionHandle, SessionStartEvent};

/// Shared dispatch pipeline: registry resolution, middleware, event fan-out.
pub(crate) struct DispatchCore {
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) hub: Arc<ObservabilityHub>,
    middleware: RwLock<Vec<Arc<dyn CommandMiddleware>>>,
    event_middleware: RwLock<Vec<Arc<dyn EventMiddleware>>>,
    filters: RwLock<Vec<Arc<dyn EventFilter>>>,
    event_log: std::sync::RwLock<Option<Arc<dyn EventLog>>>,
    raise_event_handler_errors: bool,
}

impl DispatchCore {
    fn new(raise_event_handler_errors: bool) -> Self {
        Self {
            registry: Arc::new(HandlerRegistry::new()),
            hub: Arc::new(ObservabilityHub::new()),
            middleware: RwLock::new(Vec::new()),
            event_middleware: RwLock::new(Vec::new()),
            filters: RwLock::new(Vec::new()),
            event_log: std::sync::RwLock::new(None),
            raise_event_handler_errors,
        }
    }

    fn set_event_log(&self, log: Arc<dyn EventLog>) {
        if let Ok(mut slot) = self.event_log.write() {
            *slot = Some(log);
        }
    }

    fn event_log(&self) -> Option<Arc<dyn EventLog>> {
        self.event_log.read().ok().and_then(|slot| slot.clone())
    }

    /// Resolve and invoke the single handler for a command, wrapped in the
    /// middleware chain. Routing and validation failures surface as errors;
    /// handler outcomes come back as a [`CommandResult`].
    pub(crate) async fn dispatch_command(
        &self,
        envelope: &CommandEnvelope,
    ) -> BusResult<CommandResult> {
        let binding = self.registry.resolve_command(envelope).await?;
        let chain = self.middleware.read().await.clone();
        let invoke = binding.invoke;
        let terminal: Box<Terminal> = Box::new(move |env: CommandEnvelope| {
            let invoke = Arc::clone(&invoke);
            Box::pin(async move { Ok(invoke(env).await) })
        });
        run_chain(&chain, &*terminal, envelope.clone()).await
    }

    /// Fan an event out to every visible handler, tier by tier. Handlers in
    /// one priority tier run concurrently; the next tier starts only after
    /// the previous tier finished.
    pub(crate) async fn dispatch_event(&self, envelope: &EventEnvelope) -> BusResult<()> {
        let bus_filters = self.filters.read().await.clone();
        for filter in &bus_filters {
            if !filter.matches(envelope) {
                let name = filter.name().to_string();
                debug!(
                    event_id = %envelope.event_id,
                    event_type = envelope.event_type,
                    filter = %name,
                    "event rejected by bus-wide filter"
                );
                self.hub.emit(|| BusObservation::EventFiltered {
                    event_id: envelope.event_id,
                    event_type: envelope.event_type,
                    filter: name,
                });
                return Ok(());
            }
        }

        let event_chain = self.event_middleware.read().await.clone();
        let bindings = self.registry.event_bindings(envelope).await;
        let mut ran = 0usize;
        let mut failures: Vec<(&'static str, String)> = Vec::new();

        let mut idx = 0;
        while idx < bindings.len() {
            let tier = bindings[idx].priority;
            let mut tier_runs = Vec::new();
            while idx < bindings.len() && bindings[idx].priority == tier {
                let binding = &bindings[idx];
                idx += 1;
                if let Some(rejecting) =
                    binding.filters.iter().find(|f| !f.matches(envelope))
                {
                    let name = rejecting.name().to_string();
                    self.hub.emit(|| BusObservation::EventFiltered {
                        event_id: envelope.event_id,
                        event_type: envelope.event_type,
                        filter: name,
                    });
                    continue;
                }
                let handler_name = binding.handler_name;
                let invoke = Arc::clone(&binding.invoke);
                let terminal: Box<EventTerminal> = Box::new(move |env: EventEnvelope| {
                    let invoke = Arc::clone(&invoke);
                    Box::pin(async move { invoke(env).await })
                });
                let chain = event_chain.clone();
                let env = envelope.clone();
                tier_runs.push(async move {
                    (handler_name, run_event_chain(&chain, &*terminal, env).await)
                });
            }
            for (handler_name, outcome) in join_all(tier_runs).await {
                ran += 1;
                if let Err(err) = outcome {
                    warn!(
                        event_id = %envelope.event_id,
                        event_type = envelope.event_type,
                        handler = handler_name,
                        error = %err,
                        "event handler failed"
                    );
                    let text = err.to_string();
                    self.hub.emit(|| BusObservation::EventHandlerFailed {
                        event_id: envelope.event_id,
                        event_type: envelope.event_type,
                        handler: handler_name,
                        error: text.clone(),
                    });
                    failures.push((handler_name, text));
                }
            }
        }

        if let Some(log) = self.event_log() {
            let entry = EventLogEntry {
                event_id: envelope.event_id,
                event_type: envelope.event_type.to_string(),
                session_id: envelope.session_id.clone(),
                published_at: envelope.published_at,
            };
            if let Err(err) = log.append(&entry).await {
                warn!(event_id = %envelope.event_id, error = %err, "event log append failed");
            }
        }

        let failure_count = failures.len();
        self.hub.emit(|| BusObservation::EventDelivered {
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            handlers: ran,
            failures: failure_count,
        });

        if self.raise_event_handler_errors {
            if let Some((handler, reason)) = failures.into_iter().next() {
                return Err(BusError::HandlerExecution { handler: handler.to_string(), reason });
            }
        }
        Ok(())
    }
}

/// Point-in-time counters for the intake queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    /// Messages currently waiting.
    pub depth: usize,
    /// Maximum queue size.
    pub capacity: usize,
    /// Deepest the queue has ever been.
    pub high_watermark: usize,
    /// Messages evicted under the drop-oldest policy.
    pub dropped: u64,
}

/// Point-in-time snapshot across the whole bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusMetrics {
    /// Intake queue counters.
    pub queue: QueueMetrics,
    /// Entries currently in the dead letter queue.
    pub dead_letters: usize,
    /// Schedules waiting to fire.
    pub pending_schedules: usize,
    /// Circuit breaker state per command type.
    pub circuits: HashMap<String, CircuitState>,
}

/// In-process typed message bus.
///
/// Cloning is cheap and every clone drives the same bus. Construct with
/// [`MessageBus::new`], optionally attach persistence, then [`start`].
///
/// [`start`]: MessageBus::start
#[derive(Clone)]
pub struct MessageBus {
    core: Arc<DispatchCore>,
    resilience: Arc<ResilienceLayer>,
    scheduler: Arc<EventScheduler>,
    config: BusConfig,
}

impl MessageBus {
    /// Build a bus from configuration. Nothing runs until [`Self::start`].
    pub fn new(config: BusConfig) -> Self {
        let core = Arc::new(DispatchCore::new(config.raise_event_handler_errors));
        let queue = Arc::new(IntakeQueue::new(config.queue_capacity));
        let breaker = Arc::new(
            CircuitBreakerService::new(config.breaker_config()).with_hub(Arc::clone(&core.hub)),
        );
        let dead_letters = Arc::new(DeadLetterQueue::new(config.dead_letter_capacity));
        let resilience = Arc::new(ResilienceLayer::new(
            Arc::clone(&core),
            queue,
            breaker,
            dead_letters,
            config.clone(),
        ));
        let scheduler = Arc::new(EventScheduler::new(
            Duration::from_millis(config.scheduler_tick_ms),
            Arc::clone(&core.hub),
        ));
        Self { core, resilience, scheduler, config }
    }

    /// Attach an event log appended to on every event dispatch.
    #[must_use]
    pub fn with_event_log(self, log: Arc<dyn EventLog>) -> Self {
        self.core.set_event_log(log);
        self
    }

    /// Attach a durable store for scheduled events. Schedules checkpoint
    /// before acceptance and are rehydrated by [`Self::start`].
    #[must_use]
    pub fn with_scheduled_store(self, store: Arc<dyn ScheduledStore>) -> Self {
        self.scheduler.set_store(store);
        self
    }

    /// Start the dispatch loop, scheduler, and observability worker.
    /// Restores any persisted schedules first.
    pub async fn start(&self) -> BusResult<()> {
        self.core.hub.spawn_worker();
        let restored = self.scheduler.restore().await?;
        if restored > 0 {
            info!(restored, "restored scheduled events from checkpoint");
        }
        self.resilience.start();
        self.scheduler.start(Arc::clone(&self.resilience));
        info!(
            queue_capacity = self.config.queue_capacity,
            backpressure = ?self.config.backpressure,
            "message bus started"
        );
        Ok(())
    }

    /// Stop the bus: refuse new messages, drain for the configured
    /// timeout, then discard the remainder. In-flight handlers complete.
    pub async fn stop(&self) {
        self.scheduler.stop();
        self.resilience.stop(Duration::from_millis(self.config.drain_timeout_ms)).await;
        info!("message bus stopped");
    }

    /// Direct access to the handler registry for scoped registrations.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.core.registry
    }

    /// Register a global command handler.
    pub async fn register_command_handler<C, H>(&self, handler: H) -> HandlerId
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        self.core
            .registry
            .register_command_handler::<C, H>(HandlerScope::Global, handler)
            .await
    }

    /// Register a global event handler at normal priority.
    pub async fn register_event_handler<E, H>(&self, handler: H) -> HandlerId
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.core
            .registry
            .register_event_handler::<E, H>(HandlerScope::Global, handler)
            .await
    }

    /// Register a global event handler with a priority tier and filters.
    pub async fn register_event_handler_with<E, H>(
        &self,
        priority: HandlerPriority,
        filters: Vec<Arc<dyn EventFilter>>,
        handler: H,
    ) -> HandlerId
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.core
            .registry
            .register_event_handler_with::<E, H>(HandlerScope::Global, priority, filters, handler)
            .await
    }

    /// Remove a registration by handle.
    pub async fn unregister(&self, handler_id: HandlerId) -> bool {
        self.core.registry.unregister(handler_id).await
    }

    /// Append a middleware to the end of the command chain.
    pub async fn add_middleware(&self, middleware: Arc<dyn CommandMiddleware>) {
        self.core.middleware.write().await.push(middleware);
    }

    /// Append a middleware to the end of the event chain. The chain wraps
    /// each handler invocation during fan-out.
    pub async fn add_event_middleware(&self, middleware: Arc<dyn EventMiddleware>) {
        self.core.event_middleware.write().await.push(middleware);
    }

    /// Add a bus-wide event filter applied before any handler's own.
    pub async fn add_event_filter(&self, filter: Arc<dyn EventFilter>) {
        self.core.filters.write().await.push(filter);
    }

    /// Register an observer for lifecycle observations.
    pub fn observe(&self, observer: Arc<dyn BusObserver>) -> ObserverId {
        self.core.hub.subscribe(observer)
    }

    /// Remove a previously registered observer.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.core.hub.unsubscribe(id)
    }

    /// Dispatch a command and await its result through retries.
    ///
    /// The returned result reflects the final attempt; retry and
    /// dead-letter bookkeeping happen underneath. Routing problems,
    /// validation rejections, backpressure, and an open circuit surface
    /// as errors.
    pub async fn execute<C: Command>(&self, command: C) -> BusResult<CommandResult> {
        let envelope = CommandEnvelope::new(command);
        let (tx, rx) = oneshot::channel();
        self.resilience.admit(BusMessage::Command { envelope, responder: tx }).await?;
        rx.await.map_err(|_| BusError::Stopped)?
    }

    /// Publish an event. Returns once the event is admitted; handlers run
    /// asynchronously on the dispatch loop.
    pub async fn publish<E: Event>(&self, event: E) -> BusResult<()> {
        let envelope = EventEnvelope::new(event);
        self.publish_envelope(envelope, None).await
    }

    /// Publish an event and wait until every handler has finished.
    ///
    /// With `raise_event_handler_errors` enabled, the first handler error
    /// is returned after the full fan-out completed; otherwise this only
    /// confirms delivery.
    pub async fn publish_and_wait<E: Event>(&self, event: E) -> BusResult<()> {
        let envelope = EventEnvelope::new(event);
        let (tx, rx) = oneshot::channel();
        self.publish_envelope(envelope, Some(tx)).await?;
        rx.await.map_err(|_| BusError::Stopped)?
    }

    async fn publish_envelope(
        &self,
        envelope: EventEnvelope,
        responder: Option<oneshot::Sender<BusResult<()>>>,
    ) -> BusResult<()> {
        let event_id = envelope.event_id;
        let event_type = envelope.event_type;
        let session_id = envelope.session_id.clone();
        self.resilience.admit(BusMessage::Event { envelope, responder }).await?;
        self.core.hub.emit(|| BusObservation::EventPublished {
            event_id,
            event_type,
            session_id,
        });
        Ok(())
    }

    /// Open a session with a fresh id. Publishes a [`SessionStartEvent`].
    pub async fn session(&self) -> SessionHandle {
        self.session_with_id(SessionId::new()).await
    }

    /// Open a session with a caller-chosen id.
    pub async fn session_with_id(&self, id: SessionId) -> SessionHandle {
        if let Err(err) = self.publish(SessionStartEvent { session_id: id.clone() }).await {
            warn!(session_id = %id, error = %err, "session start event not published");
        }
        self.core.hub.emit(|| BusObservation::SessionStarted { session_id: id.clone() });
        SessionHandle::new(id, self.clone())
    }

    /// Tear a session down: publish [`SessionEndEvent`] while its handlers
    /// can still see it, then remove every registration in its scope.
    pub(crate) async fn close_session(&self, session_id: &SessionId) {
        let end = SessionEndEvent { session_id: session_id.clone() };
        if let Err(err) = self.publish_and_wait(end).await {
            debug!(session_id = %session_id, error = %err, "session end event not delivered");
        }
        let removed = self.core.registry.remove_session(session_id).await;
        let session_id = session_id.clone();
        self.core.hub.emit(|| BusObservation::SessionEnded {
            session_id,
            handlers_removed: removed,
        });
    }

    /// Schedule an event for future publication. With a scheduled store
    /// attached, the schedule is checkpointed before acceptance and
    /// survives restarts.
    pub async fn schedule<E>(&self, event: E, due_at: DateTime<Utc>) -> BusResult<Uuid>
    where
        E: Event + Serialize,
    {
        self.scheduler.schedule(event, due_at).await
    }

    /// Schedule an event relative to now.
    pub async fn schedule_in<E>(&self, event: E, delay: Duration) -> BusResult<Uuid>
    where
        E: Event + Serialize,
    {
        let due_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(0));
        self.scheduler.schedule(event, due_at).await
    }

    /// Cancel a pending schedule.
    pub async fn cancel_schedule(&self, schedule_id: Uuid) -> BusResult<()> {
        self.scheduler.cancel(schedule_id).await
    }

    /// Teach the scheduler to rebuild this event type from checkpoint
    /// rows. Required before [`Self::start`] for types that must survive
    /// a restart.
    pub async fn register_scheduled_type<E>(&self)
    where
        E: Event + DeserializeOwned,
    {
        self.scheduler.register_scheduled_type::<E>().await;
    }

    /// Dead letter entries, newest first.
    pub async fn dead_letters(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.resilience.dead_letters().list(limit).await
    }

    /// Discard all dead letter entries.
    pub async fn purge_dead_letters(&self) -> usize {
        self.resilience.dead_letters().purge().await
    }

    /// Re-dispatch a dead-lettered command with a fresh retry budget.
    pub async fn replay_dead_letter(&self, command_id: CommandId) -> BusResult<CommandResult> {
        let entry = self
            .resilience
            .dead_letters()
            .take(command_id)
            .await
            .ok_or(BusError::DeadLetterNotFound(command_id))?;
        let envelope = entry.into_envelope();
        info!(command_id = %command_id, "replaying dead-lettered command");
        let (tx, rx) = oneshot::channel();
        self.resilience.admit(BusMessage::Command { envelope, responder: tx }).await?;
        rx.await.map_err(|_| BusError::Stopped)?
    }

    /// Snapshot of every circuit breaker state, keyed by command type.
    pub async fn circuit_states(&self) -> HashMap<String, CircuitState> {
        self.resilience.breaker().states().await
    }

    /// Force one circuit breaker closed.
    pub async fn reset_circuit(&self, command_type: &str) {
        self.resilience.breaker().reset(command_type).await;
    }

    /// Current intake queue depth.
    pub async fn queue_depth(&self) -> usize {
        self.resilience.queue_depth().await
    }

    /// Deepest the intake queue has been.
    pub fn queue_high_watermark(&self) -> usize {
        self.resilience.queue_high_watermark()
    }

    /// Messages evicted under the drop-oldest policy.
    pub fn dropped_total(&self) -> u64 {
        self.resilience.dropped_total()
    }

    /// Number of schedules waiting to fire.
    pub async fn pending_schedules(&self) -> usize {
        self.scheduler.pending_count().await
    }

    /// Intake queue counters in one snapshot.
    pub async fn queue_metrics(&self) -> QueueMetrics {
        QueueMetrics {
            depth: self.resilience.queue_depth().await,
            capacity: self.resilience.queue_capacity(),
            high_watermark: self.resilience.queue_high_watermark(),
            dropped: self.resilience.dropped_total(),
        }
    }

    /// Snapshot of queue, dead letter, schedule, and breaker state.
    pub async fn metrics(&self) -> BusMetrics {
        BusMetrics {
            queue: self.queue_metrics().await,
            dead_letters: self.resilience.dead_letters().len().await,
            pending_schedules: self.scheduler.pending_count().await,
            circuits: self.resilience.breaker().states().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl Command for Add {}

    struct AddHandler;

    #[async_trait]
    impl CommandHandler<Add> for AddHandler {
        async fn handle(&self, command: &Add) -> CommandResult {
            CommandResult::ok_with(CommandId::new(), serde_json::json!(command.a + command.b))
        }
    }

    #[derive(Debug)]
    struct Noted {
        text: String,
    }

    impl Event for Noted {}

    struct NoteCounter {
        count: Arc<AtomicU32>,
    }

    #[async_trait]
    impl EventHandler<Noted> for NoteCounter {
        async fn handle(&self, _event: &Noted) -> BusResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn started_bus() -> MessageBus {
        let bus = MessageBus::new(BusConfig::default());
        bus.start().await.unwrap();
        bus
    }

    #[tokio::test]
    async fn execute_returns_handler_result() {
        let bus = started_bus().await;
        bus.register_command_handler::<Add, _>(AddHandler).await;

        let result = bus.execute(Add { a: 2, b: 3 }).await.unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(serde_json::json!(5)));
        bus.stop().await;
    }

    #[tokio::test]
    async fn execute_without_handler_errors() {
        let bus = started_bus().await;

        let err = bus.execute(Add { a: 1, b: 1 }).await.unwrap_err();
        assert!(matches!(err, BusError::HandlerNotFound { .. }));
        bus.stop().await;
    }

    #[tokio::test]
    async fn publish_and_wait_runs_all_handlers() {
        let bus = started_bus().await;
        let count = Arc::new(AtomicU32::new(0));
        bus.register_event_handler::<Noted, _>(NoteCounter { count: Arc::clone(&count) }).await;
        bus.register_event_handler::<Noted, _>(NoteCounter { count: Arc::clone(&count) }).await;

        bus.publish_and_wait(Noted { text: "hello".to_string() }).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        bus.stop().await;
    }

    #[tokio::test]
    async fn publish_with_no_handlers_is_fine() {
        let bus = started_bus().await;
        bus.publish_and_wait(Noted { text: "nobody listens".to_string() }).await.unwrap();
        bus.stop().await;
    }

    #[tokio::test]
    async fn stopped_bus_rejects_messages() {
        let bus = started_bus().await;
        bus.register_command_handler::<Add, _>(AddHandler).await;
        bus.stop().await;

        let err = bus.execute(Add { a: 1, b: 1 }).await.unwrap_err();
        assert!(matches!(err, BusError::Stopped));
    }
}
