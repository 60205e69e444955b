//! Dead letter queue for commands that exhausted their retries.
//!
//! Entries keep the original envelope so a replay re-enters the normal
//! dispatch path with a fresh retry budget. The queue is bounded; when full,
//! the oldest entry is evicted.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::message::{CommandEnvelope, CommandId, Event, SessionId};

/// A command that could not be delivered.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// Id of the failed command.
    pub command_id: CommandId,
    /// Short type name of the command.
    pub command_type: String,
    /// Session the command was issued under, if any.
    pub session_id: Option<SessionId>,
    /// Error from the final attempt.
    pub error: String,
    /// Total attempts made before dead-lettering.
    pub attempts: u32,
    /// When the first attempt failed.
    pub first_failed_at: DateTime<Utc>,
    /// When the entry was recorded, which is also the final failure time.
    pub dead_lettered_at: DateTime<Utc>,
    envelope: CommandEnvelope,
}

impl DeadLetterEntry {
    pub(crate) fn new(
        envelope: CommandEnvelope,
        error: String,
        attempts: u32,
        first_failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: envelope.command_id,
            command_type: envelope.command_type.to_string(),
            session_id: envelope.session_id.clone(),
            error,
            attempts,
            first_failed_at,
            dead_lettered_at: Utc::now(),
            envelope,
        }
    }

    pub(crate) fn into_envelope(self) -> CommandEnvelope {
        self.envelope
    }
}

/// Published on the bus whenever a command is dead-lettered. Delivery is
/// fire-and-forget; any subscriber can react to it like any other event.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterCommandEvent {
    /// Id of the dead-lettered command.
    pub command_id: CommandId,
    /// Short type name of the command.
    pub command_type: String,
    /// Error from the final attempt.
    pub error: String,
    /// Total attempts made before dead-lettering.
    pub attempts: u32,
}

impl Event for DeadLetterCommandEvent {}

/// Bounded in-memory dead letter queue.
pub struct DeadLetterQueue {
    entries: RwLock<VecDeque<DeadLetterEntry>>,
    capacity: usize,
}

impl DeadLetterQueue {
    /// Create a queue retaining at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self { entries: RwLock::new(VecDeque::new()), capacity }
    }

    /// Record a dead-lettered command, evicting the oldest entry when full.
    pub(crate) async fn push(&self, entry: DeadLetterEntry) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                warn!(
                    command_id = %evicted.command_id,
                    command_type = %evicted.command_type,
                    "dead letter queue full, evicting oldest entry"
                );
            }
        }
        entries.push_back(entry);
    }

    /// Most recent entries first, up to `limit`.
    pub async fn list(&self, limit: usize) -> Vec<DeadLetterEntry> {
        let entries = self.entries.read().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Number of entries currently held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the queue holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Remove and return the entry for a command id, if present.
    pub(crate) async fn take(&self, command_id: CommandId) -> Option<DeadLetterEntry> {
        let mut entries = self.entries.write().await;
        let position = entries.iter().position(|e| e.command_id == command_id)?;
        entries.remove(position)
    }

    /// Discard every entry, returning how many were dropped.
    pub async fn purge(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::Command;

    #[derive(Debug)]
    struct Doomed;

    impl Command for Doomed {}

    fn entry() -> DeadLetterEntry {
        DeadLetterEntry::new(CommandEnvelope::new(Doomed), "boom".to_string(), 4, Utc::now())
    }

    #[tokio::test]
    async fn push_and_list_newest_first() {
        let dlq = DeadLetterQueue::new(8);
        let first = entry();
        let second = entry();
        let second_id = second.command_id;
        dlq.push(first).await;
        dlq.push(second).await;

        let listed = dlq.list(10).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].command_id, second_id);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let dlq = DeadLetterQueue::new(2);
        let first = entry();
        let first_id = first.command_id;
        dlq.push(first).await;
        dlq.push(entry()).await;
        dlq.push(entry()).await;

        assert_eq!(dlq.len().await, 2);
        assert!(dlq.take(first_id).await.is_none());
    }

    #[tokio::test]
    async fn take_removes_entry_and_returns_envelope() {
        let dlq = DeadLetterQueue::new(8);
        let e = entry();
        let id = e.command_id;
        dlq.push(e).await;

        let taken = dlq.take(id).await.unwrap();
        assert_eq!(taken.attempts, 4);
        let envelope = taken.into_envelope();
        assert!(envelope.downcast::<Doomed>().is_some());
        assert!(dlq.is_empty().await);
    }

    #[tokio::test]
    async fn purge_clears_everything() {
        let dlq = DeadLetterQueue::new(8);
        dlq.push(entry()).await;
        dlq.push(entry()).await;

        assert_eq!(dlq.purge().await, 2);
        assert!(dlq.is_empty().await);
    }
}
