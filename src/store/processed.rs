use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::now_timestamp;

/// Ledger of source messages that were delivered successfully.
#[derive(Clone)]
pub struct ProcessedLedger {
    conn: Arc<Mutex<Connection>>,
}

impl ProcessedLedger {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Record a successful send. Returns `false` when the identity was
    /// already recorded, in which case the original row is kept as is.
    pub async fn mark_processed(&self, source_id: i64, message_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT INTO processed (source_id, message_id, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_id, message_id) DO NOTHING",
                rusqlite::params![source_id, message_id, now_timestamp()],
            )
            .context("Failed to mark message processed")?;
        Ok(inserted > 0)
    }

    pub async fn is_processed(&self, source_id: i64, message_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM processed WHERE source_id = ?1 AND message_id = ?2)",
                rusqlite::params![source_id, message_id],
                |row| row.get(0),
            )
            .context("Failed to look up processed message")?;
        Ok(found)
    }
}
