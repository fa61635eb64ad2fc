use anyhow::{Context, Result};
use serde::Serialize;

use super::{today, Store};

/// Operational counters shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub queue_length: u64,
    pub success_today: u64,
    pub failed_today: u64,
    pub dead_count: u64,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queue_length={} success_today={} failed_today={} dead_count={}",
            self.queue_length, self.success_today, self.failed_today, self.dead_count
        )
    }
}

impl Store {
    /// "Today" is the current UTC date.
    pub async fn stats(&self) -> Result<Stats> {
        let today = today();
        let conn = self.conn.lock().await;

        let count = |sql: &str, with_date: bool| -> Result<u64> {
            let n: i64 = if with_date {
                conn.query_row(sql, rusqlite::params![today], |row| row.get(0))
            } else {
                conn.query_row(sql, [], |row| row.get(0))
            }
            .with_context(|| format!("Failed to compute stat: {}", sql))?;
            Ok(n as u64)
        };

        Ok(Stats {
            queue_length: count("SELECT COUNT(*) FROM queue", false)?,
            success_today: count(
                "SELECT COUNT(*) FROM processed WHERE substr(created_at, 1, 10) = ?1",
                true,
            )?,
            failed_today: count(
                "SELECT COUNT(*) FROM dead_letters WHERE substr(created_at, 1, 10) = ?1",
                true,
            )?,
            dead_count: count("SELECT COUNT(*) FROM dead_letters", false)?,
        })
    }
}
