//! Error types shared across the bus.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by dispatch, admission, and lifecycle operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// No handler is registered for the command type in any visible scope.
    #[error("no handler registered for command type {command_type}")]
    HandlerNotFound {
        /// Short type name of the command.
        command_type: String,
    },

    /// More than one handler matched a command type within the resolved scope.
    #[error("{count} handlers registered for command type {command_type}, exactly one required")]
    AmbiguousHandler {
        /// Short type name of the command.
        command_type: String,
        /// Number of conflicting registrations.
        count: usize,
    },

    /// A middleware rejected the command before it reached the handler.
    #[error("validation failed for {command_type}: {reason}")]
    Validation {
        /// Short type name of the command.
        command_type: String,
        /// Human-readable rejection reason.
        reason: String,
    },

    /// The intake queue was full and the admission policy rejected the message.
    #[error("intake queue full ({capacity} messages), admission rejected")]
    BackpressureRejected {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The circuit breaker for this command type is open.
    #[error("circuit open for command type {command_type}; retry after {retry_after:?}")]
    CircuitOpen {
        /// Short type name of the command.
        command_type: String,
        /// Time remaining until the breaker transitions to half-open.
        retry_after: Duration,
    },

    /// A handler returned an error while processing a message.
    #[error("handler {handler} failed: {reason}")]
    HandlerExecution {
        /// Name of the failing handler.
        handler: String,
        /// Error reported by the handler.
        reason: String,
    },

    /// The bus has been stopped and no longer accepts or delivers messages.
    #[error("bus is stopped")]
    Stopped,

    /// No dead letter entry exists for the given command id.
    #[error("no dead letter entry for command {0}")]
    DeadLetterNotFound(crate::domain::message::CommandId),

    /// No pending schedule exists with the given id.
    #[error("no pending schedule with id {0}")]
    ScheduleNotFound(uuid::Uuid),

    /// A scheduled event payload could not be serialized or deserialized.
    #[error("scheduled payload codec failure for {event_type}: {reason}")]
    ScheduleCodec {
        /// Short type name of the event.
        event_type: String,
        /// Underlying serde error.
        reason: String,
    },

    /// A persistence operation failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Convenience alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors raised by checkpoint stores (scheduled events, event log).
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The underlying storage engine failed.
    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    /// A persisted row could not be decoded back into a record.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_message_names_capacity() {
        let err = BusError::BackpressureRejected { capacity: 64 };
        assert!(err.to_string().contains("64"));
    }

    #[test]
    fn circuit_open_message_names_type() {
        let err = BusError::CircuitOpen {
            command_type: "DeployCommand".to_string(),
            retry_after: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("DeployCommand"));
    }

    #[test]
    fn checkpoint_errors_convert() {
        let err: BusError = CheckpointError::Corrupt("bad uuid".to_string()).into();
        assert!(matches!(err, BusError::Checkpoint(_)));
    }
}
