//! SQLite connection pool setup using sqlx.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::storage::StoreError;

/// Maximum connections in the pool.
const MAX_CONNECTIONS: u32 = 5;

/// Acquisition timeout; a saturated or wedged store surfaces as
/// `StoreError::Unavailable` instead of hanging the flush path.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect to the relational store.
///
/// WAL journal mode for concurrent readers, normal synchronous mode,
/// database created if missing. Connections are acquired from the pool
/// per operation and released on scope exit.
pub async fn connect(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    // An in-memory database exists per connection; pin the pool to a single
    // persistent connection so every operation sees the same database.
    let in_memory = url.contains(":memory:");
    let max_connections = if in_memory { 1 } else { MAX_CONNECTIONS };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(u32::from(in_memory))
        .idle_timeout(None)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await?;

    Ok(pool)
}
