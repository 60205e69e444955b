//! SQLite implementation of the event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::domain::errors::CheckpointError;
use crate::domain::message::{EventId, SessionId};
use crate::services::checkpoint::{EventLog, EventLogEntry};

/// Event log backed by the `event_log` table.
pub struct SqliteEventLog {
    pool: SqlitePool,
}

impl SqliteEventLog {
    /// Wrap an existing pool.
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct EventLogRow {
    event_id: String,
    event_type: String,
    session_id: Option<String>,
    published_at: String,
}

impl TryFrom<EventLogRow> for EventLogEntry {
    type Error = CheckpointError;

    fn try_from(row: EventLogRow) -> Result<Self, Self::Error> {
        let uuid = Uuid::parse_str(&row.event_id)
            .map_err(|e| CheckpointError::Corrupt(format!("event id {}: {e}", row.event_id)))?;
        let published_at = DateTime::parse_from_rfc3339(&row.published_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                CheckpointError::Corrupt(format!("timestamp {}: {e}", row.published_at))
            })?;
        Ok(Self {
            event_id: EventId::from_uuid(uuid),
            event_type: row.event_type,
            session_id: row.session_id.map(SessionId::from),
            published_at,
        })
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, entry: &EventLogEntry) -> Result<(), CheckpointError> {
        sqlx::query(
            "INSERT OR IGNORE INTO event_log (event_id, event_type, session_id, published_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(entry.event_id.as_uuid().to_string())
        .bind(&entry.event_type)
        .bind(entry.session_id.as_ref().map(SessionId::as_str))
        .bind(entry.published_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<EventLogEntry>, CheckpointError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<EventLogRow> =
            sqlx::query_as("SELECT * FROM event_log ORDER BY published_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(EventLogEntry::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;

    fn entry(event_type: &str, published_at: DateTime<Utc>) -> EventLogEntry {
        EventLogEntry {
            event_id: EventId::new(),
            event_type: event_type.to_string(),
            session_id: None,
            published_at,
        }
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let pool = create_test_pool().await.unwrap();
        let log = SqliteEventLog::new(pool);
        log.append(&entry("UserJoined", Utc::now())).await.unwrap();

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "UserJoined");
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let pool = create_test_pool().await.unwrap();
        let log = SqliteEventLog::new(pool);
        let base = Utc::now();
        for n in 0..5i64 {
            log.append(&entry(&format!("E{n}"), base + chrono::Duration::seconds(n)))
                .await
                .unwrap();
        }

        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "E4");
        assert_eq!(recent[1].event_type, "E3");
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_ignored() {
        let pool = create_test_pool().await.unwrap();
        let log = SqliteEventLog::new(pool);
        let e = entry("Once", Utc::now());
        log.append(&e).await.unwrap();
        log.append(&e).await.unwrap();

        assert_eq!(log.recent(10).await.unwrap().len(), 1);
    }
}
