//! SQLite connection pool management and schema bootstrap.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors establishing or verifying a pool.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Pool creation failed.
    #[error("failed to create pool: {0}")]
    PoolCreationFailed(#[source] sqlx::Error),
    /// The database URL could not be parsed.
    #[error("invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    /// The parent directory for a file database could not be created.
    #[error("failed to create directory: {0}")]
    DirectoryCreationFailed(#[source] std::io::Error),
    /// Schema bootstrap or the connectivity probe failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] sqlx::Error),
}

/// Pool sizing knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Largest number of open connections.
    pub max_connections: u32,
    /// Connections kept warm.
    pub min_connections: u32,
    /// How long acquisition waits before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

/// Open a pool against `database_url` and create the bus tables if absent.
pub async fn create_pool(
    database_url: &str,
    config: Option<PoolConfig>,
) -> Result<SqlitePool, ConnectionError> {
    let config = config.unwrap_or_default();
    ensure_database_directory(database_url)?;

    let connect_options = SqliteConnectOptions::from_str(database_url)
        .map_err(|_| ConnectionError::InvalidDatabaseUrl(database_url.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .map_err(ConnectionError::PoolCreationFailed)?;

    initialize_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests, schema included.
pub async fn create_test_pool() -> Result<SqlitePool, ConnectionError> {
    let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|_| ConnectionError::InvalidDatabaseUrl("sqlite::memory:".to_string()))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .shared_cache(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options)
        .await
        .map_err(ConnectionError::PoolCreationFailed)?;

    initialize_schema(&pool).await?;
    Ok(pool)
}

async fn initialize_schema(pool: &SqlitePool) -> Result<(), ConnectionError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS scheduled_events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            session_id TEXT,
            due_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(ConnectionError::ConnectionFailed)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scheduled_events_due_at
            ON scheduled_events(due_at)",
    )
    .execute(pool)
    .await
    .map_err(ConnectionError::ConnectionFailed)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS event_log (
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            session_id TEXT,
            published_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(ConnectionError::ConnectionFailed)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_event_log_published_at
            ON event_log(published_at)",
    )
    .execute(pool)
    .await
    .map_err(ConnectionError::ConnectionFailed)?;

    Ok(())
}

fn ensure_database_directory(database_url: &str) -> Result<(), ConnectionError> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(ConnectionError::DirectoryCreationFailed)?;
        }
    }
    Ok(())
}

/// Probe the pool with a trivial query.
pub async fn verify_connection(pool: &SqlitePool) -> Result<(), ConnectionError> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(ConnectionError::ConnectionFailed)?;
    Ok(())
}
