//! SQLite persistence for the state indexing core: indexer versions, the
//! reindex job queue and the primary state table.

mod reindex_queue;
mod state_store;

pub use reindex_queue::{QueueConfig, ReindexStore};
pub use state_store::SqliteStateStore;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("stored versions for indexer {indexer_id} do not fit a version: actual {actual}, desired {desired}")]
    VersionOutOfRange {
        indexer_id: String,
        actual: i64,
        desired: i64,
    },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

pub(crate) fn open_connection(path: impl AsRef<Path>) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;
    configure(conn)
}

pub(crate) fn open_in_memory_connection() -> Result<Connection, StorageError> {
    let conn = Connection::open_in_memory()?;
    configure(conn)
}

fn configure(mut conn: Connection) -> Result<Connection, StorageError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    migrate(&mut conn)?;
    Ok(conn)
}

pub fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Brings the schema up to `SCHEMA_VERSION`. Runs under a write lock so
/// concurrent coordinators opening the same file apply each step once.
pub fn migrate(conn: &mut Connection) -> Result<(), StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut current = schema_version(&tx)?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    if current < 1 {
        tx.execute_batch(include_str!("../migrations/0001_reindex_queue.sql"))?;
        tx.execute_batch("PRAGMA user_version = 1")?;
        current = 1;
    }

    if current < 2 {
        tx.execute_batch(include_str!("../migrations/0002_primary_states.sql"))?;
        tx.execute_batch("PRAGMA user_version = 2")?;
    }

    tx.commit()?;
    Ok(())
}

pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, StorageError> {
    let exists = conn
        .query_row(
            "
            SELECT 1
            FROM sqlite_master
            WHERE type='table' AND name = ?1
            LIMIT 1
            ",
            [table_name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(exists.is_some())
}
