//! Admission control and the batching dispatch loop.
//!
//! Every message enters through [`ResilienceLayer::admit`], which applies
//! the configured backpressure policy against the bounded intake queue. A
//! single worker drains the queue in batches and processes each item
//! concurrently: commands get the retry/breaker/dead-letter treatment,
//! events fan out once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{BackpressurePolicy, BusConfig};
use crate::domain::errors::{BusError, BusResult};
use crate::domain::message::{CommandEnvelope, CommandResult, EventEnvelope};
use crate::domain::queue::IntakeQueue;
use crate::services::bus::DispatchCore;
use crate::services::circuit_breaker::{CircuitBreakerService, CircuitDecision};
use crate::services::dead_letter::{DeadLetterCommandEvent, DeadLetterEntry, DeadLetterQueue};
use crate::services::observability::BusObservation;

/// A message admitted to the intake queue, with its reply channel.
pub(crate) enum BusMessage {
    /// A command awaiting exactly-one dispatch.
    Command {
        envelope: CommandEnvelope,
        responder: oneshot::Sender<BusResult<CommandResult>>,
    },
    /// An event awaiting fan-out. The responder is present only for
    /// publish-and-wait callers.
    Event {
        envelope: EventEnvelope,
        responder: Option<oneshot::Sender<BusResult<()>>>,
    },
}

impl BusMessage {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Command { envelope, .. } => envelope.command_type,
            Self::Event { envelope, .. } => envelope.event_type,
        }
    }

    fn key(&self) -> (bool, uuid::Uuid) {
        match self {
            Self::Command { envelope, .. } => (true, *envelope.command_id.as_uuid()),
            Self::Event { envelope, .. } => (false, *envelope.event_id.as_uuid()),
        }
    }

    /// Answer the waiting producer with an error, if anyone is waiting.
    fn reject(self, err: BusError) {
        match self {
            Self::Command { responder, .. } => {
                let _ = responder.send(Err(err));
            }
            Self::Event { responder: Some(tx), .. } => {
                let _ = tx.send(Err(err));
            }
            Self::Event { responder: None, .. } => {}
        }
    }
}

/// Owns the queue, breaker, dead letter queue, and the dispatch worker.
pub(crate) struct ResilienceLayer {
    core: Arc<DispatchCore>,
    queue: Arc<IntakeQueue<BusMessage>>,
    breaker: Arc<CircuitBreakerService>,
    dead_letters: Arc<DeadLetterQueue>,
    config: BusConfig,
    accepting: AtomicBool,
    running: Arc<AtomicBool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ResilienceLayer {
    pub(crate) fn new(
        core: Arc<DispatchCore>,
        queue: Arc<IntakeQueue<BusMessage>>,
        breaker: Arc<CircuitBreakerService>,
        dead_letters: Arc<DeadLetterQueue>,
        config: BusConfig,
    ) -> Self {
        Self {
            core,
            queue,
            breaker,
            dead_letters,
            config,
            accepting: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            worker: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub(crate) fn breaker(&self) -> &CircuitBreakerService {
        &self.breaker
    }

    pub(crate) async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    pub(crate) fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub(crate) fn queue_high_watermark(&self) -> usize {
        self.queue.high_watermark()
    }

    pub(crate) fn dropped_total(&self) -> u64 {
        self.queue.dropped_total()
    }

    /// Admit one message under the configured backpressure policy.
    pub(crate) async fn admit(&self, message: BusMessage) -> BusResult<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }
        let admitted_command = match &message {
            BusMessage::Command { envelope, .. } => {
                Some((envelope.command_id, envelope.command_type))
            }
            BusMessage::Event { .. } => None,
        };
        let message_type = message.type_name();
        let message_key = message.key();

        match self.config.backpressure {
            BackpressurePolicy::RejectNew => {
                if self.queue.try_push(message).await.is_err() {
                    self.reject_admission(message_type);
                    return Err(BusError::BackpressureRejected {
                        capacity: self.queue.capacity(),
                    });
                }
            }
            BackpressurePolicy::DropOldest => {
                if let Some(evicted) = self.queue.push_dropping_oldest(message).await {
                    let evicted_type = evicted.type_name();
                    warn!(message_type = evicted_type, "queue full, dropping oldest message");
                    self.core.hub.emit(|| BusObservation::MessageDropped {
                        message_type: evicted_type,
                    });
                    evicted.reject(BusError::BackpressureRejected {
                        capacity: self.queue.capacity(),
                    });
                }
            }
            BackpressurePolicy::AdaptiveRateLimit => {
                self.admit_adaptive(message, message_type).await?;
            }
        }

        // stop() may have flipped `accepting` between the check above and
        // the push; evict our own message so its producer is answered.
        if !self.accepting.load(Ordering::SeqCst) {
            if let Some(straggler) = self.queue.remove_where(|m| m.key() == message_key).await {
                straggler.reject(BusError::Stopped);
                return Err(BusError::Stopped);
            }
        }

        if let Some((command_id, command_type)) = admitted_command {
            let depth = self.queue.len().await;
            self.core.hub.emit(|| BusObservation::CommandAdmitted {
                command_id,
                command_type,
                queue_depth: depth,
            });
        }
        Ok(())
    }

    /// Adaptive admission: delay producers increasingly as the queue
    /// fills, rejecting only after the admission timeout.
    async fn admit_adaptive(
        &self,
        message: BusMessage,
        message_type: &'static str,
    ) -> BusResult<()> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.adaptive_admission_timeout_ms);
        let mut message = message;
        loop {
            let ratio = self.queue.fill_ratio().await;
            if ratio > 0.5 {
                tokio::time::sleep(self.adaptive_delay(ratio)).await;
            }
            match self.queue.try_push(message).await {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    message = returned;
                    if Instant::now() >= deadline {
                        self.reject_admission(message_type);
                        return Err(BusError::BackpressureRejected {
                            capacity: self.queue.capacity(),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(
                        self.config.adaptive_base_delay_ms,
                    ))
                    .await;
                }
            }
        }
    }

    fn adaptive_delay(&self, fill_ratio: f64) -> Duration {
        let base = self.config.adaptive_base_delay_ms;
        let max = self.config.adaptive_max_delay_ms.max(base);
        // Quadratic ramp from base at half-full to max at full.
        let pressure = ((fill_ratio - 0.5) * 2.0).clamp(0.0, 1.0);
        let span = (max - base) as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = base + (span * pressure * pressure) as u64;
        Duration::from_millis(delay)
    }

    fn reject_admission(&self, message_type: &'static str) {
        let capacity = self.queue.capacity();
        warn!(message_type, capacity, "admission rejected under backpressure");
        self.core.hub.emit(|| BusObservation::AdmissionRejected { message_type, capacity });
    }

    /// Spawn the dispatch worker.
    pub(crate) fn start(&self) {
        self.accepting.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        let queue = Arc::clone(&self.queue);
        let core = Arc::clone(&self.core);
        let breaker = Arc::clone(&self.breaker);
        let dead_letters = Arc::clone(&self.dead_letters);
        let running = Arc::clone(&self.running);
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            loop {
                let batch = queue.pop_batch(config.batch_size).await;
                if batch.is_empty() {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::select! {
                        () = queue.notified() => {}
                        () = tokio::time::sleep(Duration::from_millis(
                            config.batch_window_ms.max(1),
                        )) => {}
                    }
                    continue;
                }
                let work = batch.into_iter().map(|message| {
                    process_message(
                        Arc::clone(&core),
                        Arc::clone(&breaker),
                        Arc::clone(&dead_letters),
                        config.clone(),
                        message,
                    )
                });
                join_all(work).await;
            }
            debug!("dispatch worker stopped");
        });
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop accepting, drain for at most `drain_timeout`, then discard the
    /// remainder, answering each waiting producer with [`BusError::Stopped`].
    pub(crate) async fn stop(&self, drain_timeout: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + drain_timeout;
        while !self.queue.is_empty().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.running.store(false, Ordering::SeqCst);
        let remainder = self.queue.drain_all().await;
        if !remainder.is_empty() {
            warn!(discarded = remainder.len(), "drain timeout elapsed, discarding queued messages");
        }
        for message in remainder {
            message.reject(BusError::Stopped);
        }
        self.queue.wake();
        let handle = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // A producer that saw `accepting` before it flipped can land a
        // message after the drain above; sweep once more with the worker
        // gone.
        for message in self.queue.drain_all().await {
            message.reject(BusError::Stopped);
        }
    }
}

async fn process_message(
    core: Arc<DispatchCore>,
    breaker: Arc<CircuitBreakerService>,
    dead_letters: Arc<DeadLetterQueue>,
    config: BusConfig,
    message: BusMessage,
) {
    match message {
        BusMessage::Command { envelope, responder } => {
            process_command(core, breaker, dead_letters, config, envelope, responder).await;
        }
        BusMessage::Event { envelope, responder } => {
            let outcome = core.dispatch_event(&envelope).await;
            if let Some(tx) = responder {
                let _ = tx.send(outcome);
            }
        }
    }
}

async fn process_command(
    core: Arc<DispatchCore>,
    breaker: Arc<CircuitBreakerService>,
    dead_letters: Arc<DeadLetterQueue>,
    config: BusConfig,
    envelope: CommandEnvelope,
    responder: oneshot::Sender<BusResult<CommandResult>>,
) {
    let command_type = envelope.command_type;
    let command_id = envelope.command_id;
    let started = Instant::now();

    let decision = breaker.begin(command_type).await;
    if let CircuitDecision::Blocked { retry_after } = decision {
        let _ = responder.send(Err(BusError::CircuitOpen {
            command_type: command_type.to_string(),
            retry_after,
        }));
        return;
    }

    let mut attempt: u32 = 0;
    let mut first_failed_at: Option<DateTime<Utc>> = None;
    let outcome: BusResult<CommandResult> = loop {
        attempt += 1;
        match core.dispatch_command(&envelope).await {
            Ok(result) if result.success => {
                breaker.record_success(command_type).await;
                break Ok(result);
            }
            Ok(result) => {
                breaker.record_failure(command_type).await;
                let failed_at = *first_failed_at.get_or_insert_with(Utc::now);
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "handler reported failure".to_string());
                if attempt > config.max_retries {
                    dead_letter(&core, &dead_letters, &envelope, &error, attempt, failed_at).await;
                    break Ok(result);
                }
                warn!(
                    command_id = %command_id,
                    command_type,
                    attempt,
                    error = %error,
                    "command attempt failed, retrying"
                );
                core.hub.emit(|| BusObservation::CommandRetried {
                    command_id,
                    command_type,
                    attempt,
                    error: error.clone(),
                });
                tokio::time::sleep(backoff_delay(&config, attempt)).await;
                if matches!(breaker.begin(command_type).await, CircuitDecision::Blocked { .. }) {
                    dead_letter(&core, &dead_letters, &envelope, &error, attempt, failed_at).await;
                    break Ok(result);
                }
            }
            Err(err) => {
                // Routing and validation failures: the handler never ran,
                // so nothing to retry and no breaker bookkeeping beyond
                // releasing a trial slot.
                if decision == CircuitDecision::Trial {
                    breaker.abandon(command_type).await;
                }
                break Err(err);
            }
        }
    };

    match outcome {
        Ok(result) => {
            let success = result.success;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            core.hub.emit(|| BusObservation::CommandCompleted {
                command_id,
                command_type,
                success,
                attempts: attempt,
                elapsed_ms,
            });
            let _ = responder.send(Ok(result));
        }
        Err(err) => {
            let _ = responder.send(Err(err));
        }
    }
}

async fn dead_letter(
    core: &Arc<DispatchCore>,
    dead_letters: &Arc<DeadLetterQueue>,
    envelope: &CommandEnvelope,
    error: &str,
    attempts: u32,
    first_failed_at: DateTime<Utc>,
) {
    warn!(
        command_id = %envelope.command_id,
        command_type = envelope.command_type,
        attempts,
        error,
        "command exhausted retries, dead-lettering"
    );
    dead_letters
        .push(DeadLetterEntry::new(
            envelope.clone(),
            error.to_string(),
            attempts,
            first_failed_at,
        ))
        .await;
    let command_id = envelope.command_id;
    let command_type = envelope.command_type;
    let error = error.to_string();
    core.hub.emit(|| BusObservation::CommandDeadLettered {
        command_id,
        command_type,
        attempts,
        error: error.clone(),
    });
    // Fire-and-forget notification through the ordinary event path, so
    // subscribers can react without wiring an observer.
    let notice = EventEnvelope::new(DeadLetterCommandEvent {
        command_id,
        command_type: command_type.to_string(),
        error,
        attempts,
    });
    let core = Arc::clone(core);
    tokio::spawn(async move {
        if let Err(err) = core.dispatch_event(&notice).await {
            debug!(command_id = %command_id, error = %err, "dead letter event not delivered");
        }
    });
}

/// Exponential backoff: doubles from the initial delay, capped at the
/// configured maximum.
fn backoff_delay(config: &BusConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(1u64 << shift)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}
