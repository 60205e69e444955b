//! Domain layer for the message bus
//!
//! This module contains message models, the intake queue, and error types.

pub mod errors;
pub mod message;
pub mod queue;

// Re-export core types for convenient access
pub use errors::{BusError, BusResult, CheckpointError};
pub use message::{
    Command, CommandEnvelope, CommandId, CommandResult, Event, EventEnvelope, EventId,
    HandlerScope, SessionId,
};
pub use queue::IntakeQueue;
