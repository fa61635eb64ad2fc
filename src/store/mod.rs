pub mod dead_letters;
pub mod processed;
pub mod queue;
pub mod stats;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::info;

pub use dead_letters::{DeadLetter, DeadLetterStore};
pub use processed::ProcessedLedger;
pub use queue::TaskQueue;
pub use stats::Stats;

/// Thread-safe SQLite store backing the queue, the processed ledger and the
/// dead letters. Outlives the process; everything else is rebuilt on restart.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    // Wakes a blocked queue consumer when a push happens in this process.
    pushed: Arc<Notify>,
}

impl Store {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // The PRAGMA answers with the new mode, so it has to be read as a row.
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        // Producers and operator commands may hold the file from other processes.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        // Schema first, then hand the connection to the mutex.
        Self::run_migrations(&conn)?;

        info!("Store initialized at: {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Fresh in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            pushed: Arc::new(Notify::new()),
        }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub fn queue(&self) -> TaskQueue {
        TaskQueue::new(self.connection(), Arc::clone(&self.pushed))
    }

    pub fn processed(&self) -> ProcessedLedger {
        ProcessedLedger::new(self.connection())
    }

    pub fn dead_letters(&self) -> DeadLetterStore {
        DeadLetterStore::new(self.connection(), self.queue())
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            -- Pending tasks, FIFO by id
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL
            );

            -- Successful sends, one row per source message
            CREATE TABLE IF NOT EXISTS processed (
                source_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (source_id, message_id)
            );

            -- Failed tasks kept for inspection and replay
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                error TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dead_letters_created
                ON dead_letters(created_at DESC);
            ",
        )
        .context("Failed to run store migrations")?;
        Ok(())
    }
}

/// Timestamp format shared by every table: RFC 3339 in UTC, so the first ten
/// characters are the calendar date.
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_file_store_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        let store = Store::open(&path).unwrap();
        store.queue().push_raw("{}").await.unwrap();
        drop(store);

        // Migrations are idempotent and data survives a reopen.
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.queue().len().await.unwrap(), 1);
    }

    #[test]
    fn test_timestamp_starts_with_date() {
        assert!(now_timestamp().starts_with(&today()));
    }
}
