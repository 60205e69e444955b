//! Handler registry: typed registration, scope-aware resolution.
//!
//! Registrations are keyed by the message `TypeId` and a [`HandlerScope`].
//! Typed handlers are erased into downcasting closures at registration so
//! dispatch works over envelopes without generics. Commands resolve to
//! exactly one handler, session scope shadowing global; events collect every
//! visible handler ordered by priority tier.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::{BusError, BusResult};
use crate::domain::message::{
    short_type_name, Command, CommandEnvelope, CommandResult, Event, EventEnvelope, HandlerScope,
    SessionId,
};
use crate::services::filters::EventFilter;

/// Opaque handle returned by registration, used to unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Dispatch ordering tier for event handlers. Lower values run earlier;
/// handlers within a tier run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandlerPriority(pub u32);

impl HandlerPriority {
    /// Bus-internal handlers that must observe events first.
    pub const SYSTEM: Self = Self(0);
    /// Application handlers that gate later tiers.
    pub const HIGH: Self = Self(100);
    /// Default tier.
    pub const NORMAL: Self = Self(500);
    /// Background handlers, metrics, audit.
    pub const LOW: Self = Self(1000);
}

impl Default for HandlerPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Handler for a command type. Exactly one handler serves each command.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    /// Process the command and report its outcome. A result with
    /// `success == false` is treated as a failed attempt and retried.
    async fn handle(&self, command: &C) -> CommandResult;
}

/// Handler for an event type. Any number of handlers may observe an event.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Observe the event. Errors are recorded but do not stop other
    /// handlers in the same fan-out.
    async fn handle(&self, event: &E) -> BusResult<()>;
}

type CommandInvoke =
    Arc<dyn Fn(CommandEnvelope) -> BoxFuture<'static, CommandResult> + Send + Sync>;
type EventInvoke = Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, BusResult<()>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct CommandBinding {
    pub id: HandlerId,
    pub handler_name: &'static str,
    pub invoke: CommandInvoke,
}

impl std::fmt::Debug for CommandBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBinding")
            .field("id", &self.id)
            .field("handler_name", &self.handler_name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub(crate) struct EventBinding {
    pub id: HandlerId,
    pub handler_name: &'static str,
    pub priority: HandlerPriority,
    pub filters: Vec<Arc<dyn EventFilter>>,
    pub invoke: EventInvoke,
}

type CommandKey = (TypeId, HandlerScope);
type EventKey = (TypeId, HandlerScope);

/// Shared registry of command and event handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: RwLock<HashMap<CommandKey, Vec<CommandBinding>>>,
    events: RwLock<HashMap<EventKey, Vec<EventBinding>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command handler under the given scope.
    ///
    /// Duplicate registrations for the same type and scope are accepted
    /// here; the conflict surfaces as [`BusError::AmbiguousHandler`] when a
    /// matching command is dispatched.
    pub async fn register_command_handler<C, H>(&self, scope: HandlerScope, handler: H) -> HandlerId
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let id = HandlerId::new();
        let handler_name = short_type_name::<H>();
        let handler = Arc::new(handler);
        let invoke: CommandInvoke = Arc::new(move |envelope: CommandEnvelope| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                match envelope.downcast::<C>() {
                    Some(command) => handler.handle(&command).await,
                    None => CommandResult::failure(
                        envelope.command_id,
                        "command payload type mismatch",
                    ),
                }
            })
        });

        debug!(
            command_type = short_type_name::<C>(),
            handler = handler_name,
            scope = ?scope,
            "registering command handler"
        );
        let mut commands = self.commands.write().await;
        commands
            .entry((TypeId::of::<C>(), scope))
            .or_default()
            .push(CommandBinding { id, handler_name, invoke });
        id
    }

    /// Register an event handler at [`HandlerPriority::NORMAL`] with no
    /// per-handler filters.
    pub async fn register_event_handler<E, H>(&self, scope: HandlerScope, handler: H) -> HandlerId
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.register_event_handler_with(scope, HandlerPriority::NORMAL, Vec::new(), handler)
            .await
    }

    /// Register an event handler with an explicit priority tier and
    /// per-handler filters. Every filter must match for the handler to run.
    pub async fn register_event_handler_with<E, H>(
        &self,
        scope: HandlerScope,
        priority: HandlerPriority,
        filters: Vec<Arc<dyn EventFilter>>,
        handler: H,
    ) -> HandlerId
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let id = HandlerId::new();
        let handler_name = short_type_name::<H>();
        let handler = Arc::new(handler);
        let invoke: EventInvoke = Arc::new(move |envelope: EventEnvelope| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                match envelope.downcast::<E>() {
                    Some(event) => handler.handle(&event).await,
                    None => Ok(()),
                }
            })
        });

        debug!(
            event_type = short_type_name::<E>(),
            handler = handler_name,
            priority = priority.0,
            scope = ?scope,
            "registering event handler"
        );
        let mut events = self.events.write().await;
        events
            .entry((TypeId::of::<E>(), scope))
            .or_default()
            .push(EventBinding { id, handler_name, priority, filters, invoke });
        id
    }

    /// Remove a registration by its handle. Returns true when found.
    pub async fn unregister(&self, handler_id: HandlerId) -> bool {
        let mut removed = false;
        {
            let mut commands = self.commands.write().await;
            for bindings in commands.values_mut() {
                let before = bindings.len();
                bindings.retain(|b| b.id != handler_id);
                removed |= bindings.len() != before;
            }
            commands.retain(|_, v| !v.is_empty());
        }
        {
            let mut events = self.events.write().await;
            for bindings in events.values_mut() {
                let before = bindings.len();
                bindings.retain(|b| b.id != handler_id);
                removed |= bindings.len() != before;
            }
            events.retain(|_, v| !v.is_empty());
        }
        removed
    }

    /// Remove every registration scoped to the given session. Returns the
    /// number of handlers torn down.
    pub async fn remove_session(&self, session_id: &SessionId) -> usize {
        let scope = HandlerScope::Session(session_id.clone());
        let mut removed = 0;
        {
            let mut commands = self.commands.write().await;
            removed += commands
                .iter()
                .filter(|((_, s), v)| *s == scope && !v.is_empty())
                .map(|(_, v)| v.len())
                .sum::<usize>();
            commands.retain(|(_, s), _| *s != scope);
        }
        {
            let mut events = self.events.write().await;
            removed += events
                .iter()
                .filter(|((_, s), v)| *s == scope && !v.is_empty())
                .map(|(_, v)| v.len())
                .sum::<usize>();
            events.retain(|(_, s), _| *s != scope);
        }
        debug!(session_id = %session_id, removed, "removed session handlers");
        removed
    }

    /// Resolve the single handler for a command envelope.
    ///
    /// Session-scoped handlers shadow global ones entirely: when the
    /// envelope carries a session with at least one matching registration,
    /// global registrations are not consulted.
    pub(crate) async fn resolve_command(
        &self,
        envelope: &CommandEnvelope,
    ) -> BusResult<CommandBinding> {
        let commands = self.commands.read().await;
        let candidates = envelope
            .session_id
            .as_ref()
            .and_then(|sid| {
                commands.get(&(envelope.type_id(), HandlerScope::Session(sid.clone())))
            })
            .filter(|v| !v.is_empty())
            .or_else(|| commands.get(&(envelope.type_id(), HandlerScope::Global)));

        match candidates {
            None => Err(BusError::HandlerNotFound {
                command_type: envelope.command_type.to_string(),
            }),
            Some(bindings) if bindings.is_empty() => Err(BusError::HandlerNotFound {
                command_type: envelope.command_type.to_string(),
            }),
            Some(bindings) if bindings.len() > 1 => Err(BusError::AmbiguousHandler {
                command_type: envelope.command_type.to_string(),
                count: bindings.len(),
            }),
            Some(bindings) => Ok(bindings[0].clone()),
        }
    }

    /// All event handlers visible to an envelope: session-scoped first,
    /// then global, stable-sorted into priority tiers so registration
    /// order is preserved within a tier.
    pub(crate) async fn event_bindings(&self, envelope: &EventEnvelope) -> Vec<EventBinding> {
        let events = self.events.read().await;
        let mut bindings = Vec::new();
        if let Some(sid) = envelope.session_id.as_ref() {
            if let Some(scoped) =
                events.get(&(envelope.type_id(), HandlerScope::Session(sid.clone())))
            {
                bindings.extend(scoped.iter().cloned());
            }
        }
        if let Some(global) = events.get(&(envelope.type_id(), HandlerScope::Global)) {
            bindings.extend(global.iter().cloned());
        }
        bindings.sort_by_key(|b| b.priority);
        bindings
    }
}
