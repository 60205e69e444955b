//! Relaybus - typed in-process message bus
//!
//! Relaybus routes commands and events between components of a single
//! process. Commands are dispatched to exactly one handler and return a
//! [`CommandResult`]; events fan out to every matching handler in priority
//! order. Handlers can be registered globally or scoped to a session, and
//! session teardown removes the scoped handlers and notifies listeners.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): message envelopes, identifiers, the
//!   intake queue, and error types
//! - **Service Layer** (`services`): the bus itself plus the registry,
//!   middleware chain, filters, retry and circuit breaker machinery,
//!   dead letter queue, scheduler, and observability hub
//! - **Adapters** (`adapters`): SQLite-backed checkpoint stores for
//!   scheduled events and the event log
//!
//! # Example
//!
//! ```ignore
//! use relaybus::{BusConfig, MessageBus};
//!
//! #[tokio::main]
//! async fn main() -> relaybus::BusResult<()> {
//!     let bus = MessageBus::new(BusConfig::default());
//!     bus.start().await?;
//!     // register handlers, execute commands, publish events
//!     bus.stop().await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod services;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use config::{load_config, BackpressurePolicy, BusConfig, ConfigError};
pub use domain::{
    BusError, BusResult, CheckpointError, Command, CommandEnvelope, CommandId, CommandResult,
    Event, EventEnvelope, EventId, HandlerScope, SessionId,
};
pub use services::{
    BusMetrics, BusObservation, BusObserver, CircuitState, CommandHandler, CommandMiddleware,
    DeadLetterCommandEvent, DeadLetterEntry, EventFilter, EventHandler, EventLog, EventLogEntry,
    EventMiddleware, HandlerId, HandlerPriority, MessageBus, QueueMetrics, ScheduledEventRecord,
    ScheduledStore, SessionEndEvent, SessionHandle, SessionStartEvent,
};
