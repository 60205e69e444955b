//! Session lifecycle: scoped registration and exactly-once teardown.
//!
//! A [`SessionHandle`] scopes handler registrations to one session id.
//! Closing the handle publishes [`SessionEndEvent`] while the session's
//! handlers can still observe it, then removes them. Teardown runs exactly
//! once whether triggered by [`SessionHandle::close`] or by drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::message::{Command, Event, HandlerScope, SessionId};
use crate::services::bus::MessageBus;
use crate::services::filters::EventFilter;
use crate::services::registry::{CommandHandler, EventHandler, HandlerId, HandlerPriority};

/// Published when a session opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartEvent {
    /// Id of the new session.
    pub session_id: SessionId,
}

impl Event for SessionStartEvent {
    fn session_id(&self) -> Option<&SessionId> {
        Some(&self.session_id)
    }
}

/// Published when a session closes, before its handlers are removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndEvent {
    /// Id of the closing session.
    pub session_id: SessionId,
}

impl Event for SessionEndEvent {
    fn session_id(&self) -> Option<&SessionId> {
        Some(&self.session_id)
    }
}

/// Handle to an open session.
///
/// Prefer calling [`close`] explicitly; dropping the handle falls back to
/// spawning the teardown on the current runtime, which provides no
/// completion signal.
///
/// [`close`]: SessionHandle::close
pub struct SessionHandle {
    id: SessionId,
    bus: MessageBus,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, bus: MessageBus) -> Self {
        Self { id, bus, closed: Arc::new(AtomicBool::new(false)) }
    }

    /// Id of this session.
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Register a command handler visible only within this session. It
    /// shadows any global handler for the same command type.
    pub async fn register_command_handler<C, H>(&self, handler: H) -> HandlerId
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        self.bus
            .registry()
            .register_command_handler::<C, H>(HandlerScope::Session(self.id.clone()), handler)
            .await
    }

    /// Register an event handler visible only within this session.
    pub async fn register_event_handler<E, H>(&self, handler: H) -> HandlerId
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.bus
            .registry()
            .register_event_handler::<E, H>(HandlerScope::Session(self.id.clone()), handler)
            .await
    }

    /// Register a session-scoped event handler with priority and filters.
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
        self.bus
            .registry()
            .register_event_handler_with::<E, H>(
                HandlerScope::Session(self.id.clone()),
                priority,
                filters,
                handler,
            )
            .await
    }

    /// Close the session: deliver the end event, then remove every handler
    /// registered in its scope. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.close_session(&self.id).await;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let bus = self.bus.clone();
                let id = self.id.clone();
                runtime.spawn(async move {
                    bus.close_session(&id).await;
                });
            }
            Err(_) => {
                warn!(
                    session_id = %self.id,
                    "session handle dropped outside a runtime, handlers not removed"
                );
            }
        }
    }
}
