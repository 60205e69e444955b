//! Bus services: registration, dispatch, resilience, scheduling.

pub mod bus;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod filters;
pub mod middleware;
pub mod observability;
pub mod registry;
pub(crate) mod resilience;
pub(crate) mod scheduler;
pub mod session;

pub use bus::{BusMetrics, MessageBus, QueueMetrics};
pub use checkpoint::{
    EventLog, EventLogEntry, InMemoryEventLog, InMemoryScheduledStore, ScheduledEventRecord,
    ScheduledStore,
};
pub use circuit_breaker::{CircuitBreakerService, CircuitState};
pub use dead_letter::{DeadLetterCommandEvent, DeadLetterEntry, DeadLetterQueue};
pub use filters::{
    CompositeFilter, EventFilter, EventTypeFilter, PredicateFilter, RateLimitFilter,
    SessionFilter, SessionRateLimitFilter,
};
pub use middleware::{
    CommandMiddleware, EventMiddleware, EventNext, LoggingMiddleware, Next, TimingMiddleware,
    ValidationMiddleware,
};
pub use observability::{BusObservation, BusObserver, ObservabilityHub, ObserverId, TracingObserver};
pub use registry::{CommandHandler, EventHandler, HandlerId, HandlerPriority, HandlerRegistry};
pub use session::{SessionEndEvent, SessionHandle, SessionStartEvent};
