use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{now_timestamp, TaskQueue};
use crate::task::Task;

/// A task that failed delivery.
///
/// `payload` is the queue entry exactly as it was popped, so replaying it is
/// indistinguishable from the first delivery.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub source_id: i64,
    pub message_id: i64,
    pub error: String,
    pub payload: String,
    pub created_at: String,
}

impl DeadLetter {
    /// Decode the stored payload. Fails for entries that were malformed when
    /// they were first popped.
    pub fn task(&self) -> Result<Task> {
        serde_json::from_str(&self.payload)
            .with_context(|| format!("Dead letter {} holds an undecodable payload", self.id))
    }

    /// First 200 characters of the task text, for listings.
    pub fn preview(&self) -> String {
        self.task()
            .map(|t| t.text.chars().take(200).collect())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct DeadLetterStore {
    conn: Arc<Mutex<Connection>>,
    queue: TaskQueue,
}

impl DeadLetterStore {
    pub fn new(conn: Arc<Mutex<Connection>>, queue: TaskQueue) -> Self {
        Self { conn, queue }
    }

    /// Append a dead letter and return its id.
    pub async fn save(
        &self,
        source_id: i64,
        message_id: i64,
        error: &str,
        payload: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO dead_letters (source_id, message_id, error, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![source_id, message_id, error, payload, now_timestamp()],
        )
        .context("Failed to save dead letter")?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent first, at most `limit` entries.
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, message_id, error, payload, created_at
             FROM dead_letters
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;
        let letters = stmt
            .query_map(rusqlite::params![limit as i64], parse_dead_letter_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list dead letters")?;
        Ok(letters)
    }

    pub async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<DeadLetter>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT id, source_id, message_id, error, payload, created_at
             FROM dead_letters WHERE id IN ({})
             ORDER BY id ASC",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let letters = stmt
            .query_map(rusqlite::params_from_iter(ids), parse_dead_letter_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load dead letters")?;
        Ok(letters)
    }

    pub async fn delete_by_ids(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().await;
        let sql = format!("DELETE FROM dead_letters WHERE id IN ({})", placeholders(ids.len()));
        conn.execute(&sql, rusqlite::params_from_iter(ids))
            .context("Failed to delete dead letters")
    }

    /// Push the stored payloads back onto the queue, then delete them.
    ///
    /// Unknown ids are ignored. Returns how many entries were re-enqueued.
    /// A crash between the push and the delete leaves a duplicate in the
    /// queue, never a lost task.
    pub async fn replay(&self, ids: &[i64]) -> Result<usize> {
        let letters = self.get_by_ids(ids).await?;
        let mut consumed = Vec::with_capacity(letters.len());

        for letter in &letters {
            self.queue.push_raw(&letter.payload).await?;
            consumed.push(letter.id);
        }
        self.delete_by_ids(&consumed).await?;

        info!("Replayed {} dead letter(s): {:?}", consumed.len(), consumed);
        Ok(consumed.len())
    }

    pub async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))
            .context("Failed to count dead letters")?;
        Ok(count as u64)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn parse_dead_letter_row(row: &rusqlite::Row) -> rusqlite::Result<DeadLetter> {
    Ok(DeadLetter {
        id: row.get(0)?,
        source_id: row.get(1)?,
        message_id: row.get(2)?,
        error: row.get(3)?,
        payload: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::store::Store;
    use crate::task::Task;

    fn payload(message_id: i64) -> String {
        format!(
            r#"{{"source_id":-100,"message_id":{},"text":"text {}","target_channel_id":"634"}}"#,
            message_id, message_id
        )
    }

    #[tokio::test]
    async fn test_save_and_list_most_recent_first() {
        let store = Store::open_in_memory().unwrap();
        let dead = store.dead_letters();

        for id in 1..=3 {
            dead.save(-100, id, "http 500: boom", &payload(id)).await.unwrap();
        }

        let listed = dead.list(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].message_id, 3);
        assert_eq!(listed[1].message_id, 2);
        assert_eq!(listed[0].error, "http 500: boom");
        assert_eq!(listed[0].preview(), "text 3");
    }

    #[tokio::test]
    async fn test_get_and_delete_by_ids() {
        let store = Store::open_in_memory().unwrap();
        let dead = store.dead_letters();

        let a = dead.save(-100, 1, "e", &payload(1)).await.unwrap();
        let b = dead.save(-100, 2, "e", &payload(2)).await.unwrap();

        let got = dead.get_by_ids(&[b, 999]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, b);

        assert_eq!(dead.delete_by_ids(&[a]).await.unwrap(), 1);
        assert_eq!(dead.count().await.unwrap(), 1);
        assert!(dead.get_by_ids(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_requeues_payload_and_removes_entry() {
        let store = Store::open_in_memory().unwrap();
        let dead = store.dead_letters();
        let queue = store.queue();

        for id in 1..=7 {
            dead.save(-100, id, "http 500", &payload(id)).await.unwrap();
        }

        let replayed = dead.replay(&[7]).await.unwrap();
        assert_eq!(replayed, 1);

        let entry = queue.try_pop().await.unwrap().unwrap();
        assert_eq!(entry.payload, payload(7));
        let task: Task = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(task.message_id, 7);

        let listed = dead.list(100).await.unwrap();
        assert_eq!(listed.len(), 6);
        assert!(listed.iter().all(|d| d.id != 7));
    }

    #[tokio::test]
    async fn test_replay_ignores_unknown_ids() {
        let store = Store::open_in_memory().unwrap();
        let dead = store.dead_letters();

        assert_eq!(dead.replay(&[42]).await.unwrap(), 0);
        assert_eq!(store.queue().len().await.unwrap(), 0);
    }
}
