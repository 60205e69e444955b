//! Message model: commands, events, envelopes, and session identity.
//!
//! Commands and events are plain user types marked by the [`Command`] and
//! [`Event`] traits. The bus moves them through type-erased envelopes so a
//! single dispatch pipeline can carry any registered type; handlers get the
//! concrete type back via a checked downcast.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a command dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Generate a new random command id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Access the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a new random event id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID, used when decoding persisted entries.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Access the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a logical conversation or workflow scope.
///
/// Handlers registered under a session are torn down together when the
/// session closes. The string form is stable across process restarts so
/// sessions can be referenced from persisted schedules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The session id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Visibility scope of a handler registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerScope {
    /// Visible to every message of the matching type.
    Global,
    /// Visible only to messages carrying this session id.
    Session(SessionId),
}

impl HandlerScope {
    /// The session id for session-scoped registrations, `None` for global.
    pub const fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Global => None,
            Self::Session(id) => Some(id),
        }
    }
}

/// Marker trait for request-style messages with exactly one handler.
pub trait Command: Any + Send + Sync + fmt::Debug + 'static {
    /// Session this command belongs to, if any. Session-scoped handlers
    /// take precedence over global ones during resolution.
    fn session_id(&self) -> Option<&SessionId> {
        None
    }
}

/// Marker trait for fact-style messages fanned out to zero or more handlers.
pub trait Event: Any + Send + Sync + fmt::Debug + 'static {
    /// Session this event belongs to, if any.
    fn session_id(&self) -> Option<&SessionId> {
        None
    }
}

/// Outcome of a command dispatch, returned to the caller of `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Id of the command this result answers.
    pub command_id: CommandId,
    /// Whether the handler completed successfully.
    pub success: bool,
    /// Optional structured payload produced by the handler.
    pub result: Option<serde_json::Value>,
    /// Error description when `success` is false.
    pub error: Option<String>,
}

impl CommandResult {
    /// Successful result with no payload.
    pub const fn ok(command_id: CommandId) -> Self {
        Self { command_id, success: true, result: None, error: None }
    }

    /// Successful result carrying a payload.
    pub const fn ok_with(command_id: CommandId, value: serde_json::Value) -> Self {
        Self { command_id, success: true, result: Some(value), error: None }
    }

    /// Failed result with an error description.
    pub fn failure(command_id: CommandId, error: impl Into<String>) -> Self {
        Self { command_id, success: false, result: None, error: Some(error.into()) }
    }
}

/// Short type name without the module path, used for logs and breaker keys.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Type-erased command in flight, cheap to clone across retry attempts.
#[derive(Clone)]
pub struct CommandEnvelope {
    /// Unique id assigned at admission.
    pub command_id: CommandId,
    /// Short type name of the payload.
    pub command_type: &'static str,
    /// Session the command was issued under, if any.
    pub session_id: Option<SessionId>,
    /// Wall-clock time the envelope was created.
    pub created_at: DateTime<Utc>,
    type_id: TypeId,
    payload: Arc<dyn Any + Send + Sync>,
}

impl CommandEnvelope {
    /// Wrap a concrete command for dispatch.
    pub fn new<C: Command>(command: C) -> Self {
        let session_id = command.session_id().cloned();
        Self {
            command_id: CommandId::new(),
            command_type: short_type_name::<C>(),
            session_id,
            created_at: Utc::now(),
            type_id: TypeId::of::<C>(),
            payload: Arc::new(command),
        }
    }

    /// Type id of the wrapped command, used as the registry key.
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Recover the concrete command type. Returns `None` on a type
    /// mismatch, which the registry key makes unreachable in practice.
    pub fn downcast<C: Command>(&self) -> Option<Arc<C>> {
        Arc::clone(&self.payload).downcast::<C>().ok()
    }
}

impl fmt::Debug for CommandEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEnvelope")
            .field("command_id", &self.command_id)
            .field("command_type", &self.command_type)
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Type-erased event in flight.
#[derive(Clone)]
pub struct EventEnvelope {
    /// Unique id assigned at publication.
    pub event_id: EventId,
    /// Short type name of the payload.
    pub event_type: &'static str,
    /// Session the event was published under, if any.
    pub session_id: Option<SessionId>,
    /// Wall-clock time the envelope was created.
    pub published_at: DateTime<Utc>,
    type_id: TypeId,
    payload: Arc<dyn Any + Send + Sync>,
}

impl EventEnvelope {
    /// Wrap a concrete event for fan-out.
    pub fn new<E: Event>(event: E) -> Self {
        Self::from_arc(Arc::new(event))
    }

    /// Wrap an already shared event.
    pub fn from_arc<E: Event>(event: Arc<E>) -> Self {
        let session_id = event.session_id().cloned();
        Self {
            event_id: EventId::new(),
            event_type: short_type_name::<E>(),
            session_id,
            published_at: Utc::now(),
            type_id: TypeId::of::<E>(),
            payload: event,
        }
    }

    /// Type id of the wrapped event, used as the registry key.
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Recover the concrete event type.
    pub fn downcast<E: Event>(&self) -> Option<Arc<E>> {
        Arc::clone(&self.payload).downcast::<E>().ok()
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("event_id", &self.event_id)
            .field("event_type", &self.event_type)
            .field("session_id", &self.session_id)
            .field("published_at", &self.published_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping {
        session: Option<SessionId>,
    }

    impl Command for Ping {
        fn session_id(&self) -> Option<&SessionId> {
            self.session.as_ref()
        }
    }

    #[derive(Debug, PartialEq)]
    struct Pinged {
        count: u32,
    }

    impl Event for Pinged {}

    #[test]
    fn command_envelope_captures_session_and_type() {
        let sid = SessionId::from("session-1");
        let env = CommandEnvelope::new(Ping { session: Some(sid.clone()) });

        assert_eq!(env.command_type, "Ping");
        assert_eq!(env.session_id, Some(sid));
        assert_eq!(env.type_id(), TypeId::of::<Ping>());
    }

    #[test]
    fn envelope_downcast_recovers_payload() {
        let env = EventEnvelope::new(Pinged { count: 7 });

        let recovered = env.downcast::<Pinged>().unwrap();
        assert_eq!(*recovered, Pinged { count: 7 });
        assert!(env.downcast::<OtherEvent>().is_none());
    }

    #[derive(Debug)]
    struct OtherEvent;

    impl Event for OtherEvent {}

    #[test]
    fn clone_shares_payload_and_identity() {
        let env = CommandEnvelope::new(Ping { session: None });
        let copy = env.clone();

        assert_eq!(env.command_id, copy.command_id);
        assert!(copy.downcast::<Ping>().is_some());
    }

    #[test]
    fn short_names_strip_module_paths() {
        assert_eq!(short_type_name::<Pinged>(), "Pinged");
    }

    #[test]
    fn session_ids_round_trip_strings() {
        let sid = SessionId::from("abc");
        assert_eq!(sid.as_str(), "abc");
        assert_eq!(sid.to_string(), "abc");
    }
}
