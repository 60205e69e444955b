//! SQLite implementation of the scheduled event store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::CheckpointError;
use crate::domain::message::SessionId;
use crate::services::checkpoint::{ScheduledEventRecord, ScheduledStore};

/// Scheduled event store backed by the `scheduled_events` table.
pub struct SqliteScheduledStore {
    pool: SqlitePool,
}

impl SqliteScheduledStore {
    /// Wrap an existing pool. The schema is created by the connection
    /// helpers in this module's parent.
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ScheduledRow {
    id: String,
    event_type: String,
    payload: String,
    session_id: Option<String>,
    due_at: String,
    created_at: String,
}

impl TryFrom<ScheduledRow> for ScheduledEventRecord {
    type Error = CheckpointError;

    fn try_from(row: ScheduledRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| CheckpointError::Corrupt(format!("schedule id {}: {e}", row.id)))?;
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| CheckpointError::Corrupt(format!("schedule {id} payload: {e}")))?;
        let due_at = parse_timestamp(&row.due_at)?;
        let created_at = parse_timestamp(&row.created_at)?;
        Ok(Self {
            id,
            event_type: row.event_type,
            payload,
            session_id: row.session_id.map(SessionId::from),
            due_at,
            created_at,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CheckpointError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CheckpointError::Corrupt(format!("timestamp {raw}: {e}")))
}

#[async_trait]
impl ScheduledStore for SqliteScheduledStore {
    async fn save(&self, record: &ScheduledEventRecord) -> Result<(), CheckpointError> {
        sqlx::query(
            "INSERT OR REPLACE INTO scheduled_events
                (id, event_type, payload, session_id, due_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.event_type)
        .bind(record.payload.to_string())
        .bind(record.session_id.as_ref().map(SessionId::as_str))
        .bind(record.due_at.to_rfc3339())
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM scheduled_events WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ScheduledEventRecord>, CheckpointError> {
        let rows: Vec<ScheduledRow> =
            sqlx::query_as("SELECT * FROM scheduled_events ORDER BY due_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ScheduledEventRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;

    fn record(event_type: &str, due_in_secs: i64) -> ScheduledEventRecord {
        ScheduledEventRecord {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload: serde_json::json!({"text": "hi"}),
            session_id: Some(SessionId::from("s1")),
            due_at: Utc::now() + chrono::Duration::seconds(due_in_secs),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let pool = create_test_pool().await.unwrap();
        let store = SqliteScheduledStore::new(pool);
        let rec = record("ReminderDue", 60);
        store.save(&rec).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, rec.id);
        assert_eq!(loaded[0].event_type, "ReminderDue");
        assert_eq!(loaded[0].payload["text"], "hi");
        assert_eq!(loaded[0].session_id, Some(SessionId::from("s1")));
    }

    #[tokio::test]
    async fn load_orders_by_due_time() {
        let pool = create_test_pool().await.unwrap();
        let store = SqliteScheduledStore::new(pool);
        let late = record("A", 120);
        let soon = record("B", 10);
        store.save(&late).await.unwrap();
        store.save(&soon).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded[0].id, soon.id);
        assert_eq!(loaded[1].id, late.id);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let pool = create_test_pool().await.unwrap();
        let store = SqliteScheduledStore::new(pool);
        let rec = record("A", 60);
        store.save(&rec).await.unwrap();

        store.delete(rec.id).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_payload_is_reported() {
        let pool = create_test_pool().await.unwrap();
        sqlx::query(
            "INSERT INTO scheduled_events (id, event_type, payload, session_id, due_at, created_at)
             VALUES ('not-a-uuid', 'X', '{}', NULL, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();
        let store = SqliteScheduledStore::new(pool);

        let err = store.load_all().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt(_)));
    }
}
