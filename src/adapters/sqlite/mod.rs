//! SQLite adapters for the bus checkpoint ports.

pub mod connection;
pub mod event_log_repository;
pub mod scheduled_repository;

pub use connection::{
    create_pool, create_test_pool, verify_connection, ConnectionError, PoolConfig,
};
pub use event_log_repository::SqliteEventLog;
pub use scheduled_repository::SqliteScheduledStore;
