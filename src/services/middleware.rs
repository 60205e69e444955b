//! Command and event middleware: ordered wrappers around handler invocation.
//!
//! Middleware compose as an onion. Each layer receives the envelope and a
//! [`Next`] continuation; calling `next.run(...)` proceeds inward, skipping
//! it short-circuits the dispatch. The innermost layer is the resolved
//! handler itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::domain::errors::{BusError, BusResult};
use crate::domain::message::{CommandEnvelope, CommandResult, EventEnvelope};

pub(crate) type Terminal =
    dyn Fn(CommandEnvelope) -> BoxFuture<'static, BusResult<CommandResult>> + Send + Sync;

/// Continuation handed to each middleware layer.
pub struct Next<'a> {
    pub(crate) chain: &'a [Arc<dyn CommandMiddleware>],
    pub(crate) terminal: &'a Terminal,
}

impl Next<'_> {
    /// Proceed to the next layer, ending at the handler.
    pub async fn run(self, command: CommandEnvelope) -> BusResult<CommandResult> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(command, Next { chain: rest, terminal: self.terminal }).await
            }
            None => (self.terminal)(command).await,
        }
    }
}

/// A wrapper around command dispatch.
#[async_trait]
pub trait CommandMiddleware: Send + Sync {
    /// Wrap the dispatch. Implementations decide whether to call
    /// `next.run(command)` and may transform or reject the outcome.
    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> BusResult<CommandResult>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "middleware"
    }
}

/// Run a full chain over an envelope with the given terminal handler.
pub(crate) async fn run_chain(
    chain: &[Arc<dyn CommandMiddleware>],
    terminal: &Terminal,
    command: CommandEnvelope,
) -> BusResult<CommandResult> {
    Next { chain, terminal }.run(command).await
}

pub(crate) type EventTerminal =
    dyn Fn(EventEnvelope) -> BoxFuture<'static, BusResult<()>> + Send + Sync;

/// Continuation handed to each event middleware layer.
pub struct EventNext<'a> {
    pub(crate) chain: &'a [Arc<dyn EventMiddleware>],
    pub(crate) terminal: &'a EventTerminal,
}

impl EventNext<'_> {
    /// Proceed to the next layer, ending at the handler.
    pub async fn run(self, event: EventEnvelope) -> BusResult<()> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(event, EventNext { chain: rest, terminal: self.terminal }).await
            }
            None => (self.terminal)(event).await,
        }
    }
}

/// A wrapper around one event handler invocation. The chain runs once per
/// matching handler, not once per event.
#[async_trait]
pub trait EventMiddleware: Send + Sync {
    /// Wrap the invocation. Same contract as [`CommandMiddleware::handle`]:
    /// call `next.run(event)` exactly once or short-circuit.
    async fn handle(&self, event: EventEnvelope, next: EventNext<'_>) -> BusResult<()>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "middleware"
    }
}

/// Run a full event chain with the given terminal handler.
pub(crate) async fn run_event_chain(
    chain: &[Arc<dyn EventMiddleware>],
    terminal: &EventTerminal,
    event: EventEnvelope,
) -> BusResult<()> {
    EventNext { chain, terminal }.run(event).await
}

/// Logs every command dispatch with its outcome and duration.
#[derive(Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    /// Create the middleware.
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandMiddleware for LoggingMiddleware {
    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> BusResult<CommandResult> {
        let command_type = command.command_type;
        let command_id = command.command_id;
        debug!(command_id = %command_id, command_type, "dispatching command");
        let started = Instant::now();
        let outcome = next.run(command).await;
        let elapsed_ms = started.elapsed().as_millis();
        match &outcome {
            Ok(result) if result.success => {
                debug!(command_id = %command_id, command_type, elapsed_ms, "command succeeded");
            }
            Ok(result) => {
                debug!(
                    command_id = %command_id,
                    command_type,
                    elapsed_ms,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "command failed"
                );
            }
            Err(err) => {
                debug!(command_id = %command_id, command_type, elapsed_ms, error = %err, "command errored");
            }
        }
        outcome
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Warns when a dispatch exceeds a latency threshold.
pub struct TimingMiddleware {
    slow_threshold: Duration,
}

impl TimingMiddleware {
    /// Warn when dispatch takes longer than `slow_threshold`.
    pub const fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

#[async_trait]
impl CommandMiddleware for TimingMiddleware {
    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> BusResult<CommandResult> {
        let command_type = command.command_type;
        let started = Instant::now();
        let outcome = next.run(command).await;
        let elapsed = started.elapsed();
        if elapsed > self.slow_threshold {
            warn!(
                command_type,
                elapsed_ms = elapsed.as_millis(),
                threshold_ms = self.slow_threshold.as_millis(),
                "slow command dispatch"
            );
        }
        outcome
    }

    fn name(&self) -> &str {
        "timing"
    }
}

/// Rejects commands failing a validation predicate before they reach the
/// handler. Rejections are not retried and never count against the circuit
/// breaker.
pub struct ValidationMiddleware {
    validate: Box<dyn Fn(&CommandEnvelope) -> Result<(), String> + Send + Sync>,
}

impl ValidationMiddleware {
    /// Wrap a validation predicate. `Err(reason)` rejects the command.
    pub fn new<F>(validate: F) -> Self
    where
        F: Fn(&CommandEnvelope) -> Result<(), String> + Send + Sync + 'static,
    {
        Self { validate: Box::new(validate) }
    }
}

#[async_trait]
impl CommandMiddleware for ValidationMiddleware {
    async fn handle(&self, command: CommandEnvelope, next: Next<'_>) -> BusResult<CommandResult> {
        if let Err(reason) = (self.validate)(&command) {
            return Err(BusError::Validation {
                command_type: command.command_type.to_string(),
                reason,
            });
        }
        next.run(command).await
    }

    fn name(&self) -> &str {
        "validation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::Command;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Noop;

    impl Command for Noop {}

    fn terminal_ok() -> Box<Terminal> {
        Box::new(|env: CommandEnvelope| {
            Box::pin(async move { Ok(CommandResult::ok(env.command_id)) })
        })
    }

    /// Records the order in which it runs relative to other layers.
    struct TagMiddleware {
        tag: u32,
        order: Arc<AtomicU32>,
        seen: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CommandMiddleware for TagMiddleware {
        async fn handle(
            &self,
            command: CommandEnvelope,
            next: Next<'_>,
        ) -> BusResult<CommandResult> {
            let position = self.order.fetch_add(1, Ordering::SeqCst);
            if position == 0 {
                self.seen.store(self.tag, Ordering::SeqCst);
            }
            next.run(command).await
        }
    }

    #[tokio::test]
    async fn chain_runs_in_registration_order() {
        let order = Arc::new(AtomicU32::new(0));
        let seen_first = Arc::new(AtomicU32::new(0));
        let chain: Vec<Arc<dyn CommandMiddleware>> = vec![
            Arc::new(TagMiddleware {
                tag: 1,
                order: Arc::clone(&order),
                seen: Arc::clone(&seen_first),
            }),
            Arc::new(TagMiddleware {
                tag: 2,
                order: Arc::clone(&order),
                seen: Arc::clone(&seen_first),
            }),
        ];
        let terminal = terminal_ok();

        let result = run_chain(&chain, &*terminal, CommandEnvelope::new(Noop)).await.unwrap();
        assert!(result.success);
        assert_eq!(seen_first.load(Ordering::SeqCst), 1);
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_chain_reaches_terminal() {
        let terminal = terminal_ok();
        let result = run_chain(&[], &*terminal, CommandEnvelope::new(Noop)).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn validation_short_circuits_handler() {
        let invoked = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invoked);
        let terminal: Box<Terminal> = Box::new(move |env: CommandEnvelope| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(CommandResult::ok(env.command_id))
            })
        });
        let chain: Vec<Arc<dyn CommandMiddleware>> =
            vec![Arc::new(ValidationMiddleware::new(|_| Err("nope".to_string())))];

        let err = run_chain(&chain, &*terminal, CommandEnvelope::new(Noop)).await.unwrap_err();
        assert!(matches!(err, BusError::Validation { .. }));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validation_passes_valid_commands() {
        let terminal = terminal_ok();
        let chain: Vec<Arc<dyn CommandMiddleware>> =
            vec![Arc::new(ValidationMiddleware::new(|_| Ok(())))];

        let result = run_chain(&chain, &*terminal, CommandEnvelope::new(Noop)).await.unwrap();
        assert!(result.success);
    }

    #[derive(Debug)]
    struct Ping;

    impl crate::domain::message::Event for Ping {}

    struct CountingEventMiddleware {
        calls: Arc<AtomicU32>,
        pass_through: bool,
    }

    #[async_trait]
    impl EventMiddleware for CountingEventMiddleware {
        async fn handle(&self, event: EventEnvelope, next: EventNext<'_>) -> BusResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.pass_through {
                next.run(event).await
            } else {
                Ok(())
            }
        }
    }

    fn counting_event_terminal(delivered: Arc<AtomicU32>) -> Box<EventTerminal> {
        Box::new(move |_env: EventEnvelope| {
            let delivered = Arc::clone(&delivered);
            Box::pin(async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn event_chain_wraps_the_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let delivered = Arc::new(AtomicU32::new(0));
        let chain: Vec<Arc<dyn EventMiddleware>> = vec![Arc::new(CountingEventMiddleware {
            calls: Arc::clone(&calls),
            pass_through: true,
        })];
        let terminal = counting_event_terminal(Arc::clone(&delivered));

        run_event_chain(&chain, &*terminal, EventEnvelope::new(Ping)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn event_middleware_can_short_circuit_delivery() {
        let calls = Arc::new(AtomicU32::new(0));
        let delivered = Arc::new(AtomicU32::new(0));
        let chain: Vec<Arc<dyn EventMiddleware>> = vec![Arc::new(CountingEventMiddleware {
            calls: Arc::clone(&calls),
            pass_through: false,
        })];
        let terminal = counting_event_terminal(Arc::clone(&delivered));

        run_event_chain(&chain, &*terminal, EventEnvelope::new(Ping)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn logging_and_timing_are_transparent() {
        let terminal = terminal_ok();
        let chain: Vec<Arc<dyn CommandMiddleware>> = vec![
            Arc::new(LoggingMiddleware::new()),
            Arc::new(TimingMiddleware::new(Duration::from_secs(1))),
        ];

        let result = run_chain(&chain, &*terminal, CommandEnvelope::new(Noop)).await.unwrap();
        assert!(result.success);
    }
}
