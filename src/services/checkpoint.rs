//! Checkpoint ports for durable scheduling and the event log.
//!
//! Persistence is optional everywhere it appears: a bus without a store
//! keeps schedules in memory only, and one without a log simply skips the
//! append. In-memory implementations back tests and single-process use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::CheckpointError;
use crate::domain::message::{EventId, SessionId};

/// Persisted form of a future-dated event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEventRecord {
    /// Schedule id, also used for cancellation.
    pub id: Uuid,
    /// Short type name of the event, matched against registered
    /// rehydrators at restore time.
    pub event_type: String,
    /// JSON-encoded event payload.
    pub payload: serde_json::Value,
    /// Session the event was scheduled under, if any.
    pub session_id: Option<SessionId>,
    /// When the event becomes due.
    pub due_at: DateTime<Utc>,
    /// When the schedule was created.
    pub created_at: DateTime<Utc>,
}

/// Metadata row appended for every dispatched event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Id of the published event.
    pub event_id: EventId,
    /// Short type name of the event.
    pub event_type: String,
    /// Session the event was published under, if any.
    pub session_id: Option<SessionId>,
    /// When the event was published.
    pub published_at: DateTime<Utc>,
}

/// Durable store for scheduled events that must survive restarts.
#[async_trait]
pub trait ScheduledStore: Send + Sync {
    /// Persist a schedule. Called before the schedule is accepted.
    async fn save(&self, record: &ScheduledEventRecord) -> Result<(), CheckpointError>;

    /// Remove a schedule, either after it fires or on cancellation.
    async fn delete(&self, id: Uuid) -> Result<(), CheckpointError>;

    /// Load every persisted schedule, due-soonest first.
    async fn load_all(&self) -> Result<Vec<ScheduledEventRecord>, CheckpointError>;
}

/// Append-only log of dispatched event metadata.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one entry. Failures are logged by the caller, never fatal.
    async fn append(&self, entry: &EventLogEntry) -> Result<(), CheckpointError>;

    /// Most recent entries, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<EventLogEntry>, CheckpointError>;
}

/// In-memory scheduled store for tests and non-durable buses.
#[derive(Default)]
pub struct InMemoryScheduledStore {
    records: RwLock<Vec<ScheduledEventRecord>>,
}

impl InMemoryScheduledStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduledStore for InMemoryScheduledStore {
    async fn save(&self, record: &ScheduledEventRecord) -> Result<(), CheckpointError> {
        let mut records = self.records.write().await;
        records.retain(|r| r.id != record.id);
        records.push(record.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), CheckpointError> {
        self.records.write().await.retain(|r| r.id != id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ScheduledEventRecord>, CheckpointError> {
        let mut records = self.records.read().await.clone();
        records.sort_by_key(|r| r.due_at);
        Ok(records)
    }
}

/// In-memory event log for tests and debugging.
#[derive(Default)]
pub struct InMemoryEventLog {
    entries: RwLock<Vec<EventLogEntry>>,
}

impl InMemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, entry: &EventLogEntry) -> Result<(), CheckpointError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<EventLogEntry>, CheckpointError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(due_in_secs: i64) -> ScheduledEventRecord {
        ScheduledEventRecord {
            id: Uuid::new_v4(),
            event_type: "ReminderDue".to_string(),
            payload: serde_json::json!({"text": "hi"}),
            session_id: None,
            due_at: Utc::now() + Duration::seconds(due_in_secs),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_load_orders_by_due_time() {
        let store = InMemoryScheduledStore::new();
        let late = record(60);
        let soon = record(5);
        store.save(&late).await.unwrap();
        store.save(&soon).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, soon.id);
    }

    #[tokio::test]
    async fn delete_removes_schedule() {
        let store = InMemoryScheduledStore::new();
        let rec = record(5);
        store.save(&rec).await.unwrap();
        store.delete(rec.id).await.unwrap();

        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_overwrites_same_id() {
        let store = InMemoryScheduledStore::new();
        let mut rec = record(5);
        store.save(&rec).await.unwrap();
        rec.payload = serde_json::json!({"text": "updated"});
        store.save(&rec).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].payload["text"], "updated");
    }

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let log = InMemoryEventLog::new();
        for n in 0..3 {
            log.append(&EventLogEntry {
                event_id: EventId::new(),
                event_type: format!("Event{n}"),
                session_id: None,
                published_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "Event2");
    }
}
