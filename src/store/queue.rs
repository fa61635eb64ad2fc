use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::now_timestamp;
use crate::task::Task;

/// A popped queue entry. `payload` is the exact JSON that was pushed.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub payload: String,
}

/// Durable FIFO of JSON-encoded tasks.
///
/// Popping removes the entry outright; there is no lease or acknowledgement,
/// so a task popped by a process that then dies is gone.
#[derive(Clone)]
pub struct TaskQueue {
    conn: Arc<Mutex<Connection>>,
    pushed: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(conn: Arc<Mutex<Connection>>, pushed: Arc<Notify>) -> Self {
        Self { conn, pushed }
    }

    pub async fn push(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(task).context("Failed to encode task")?;
        self.push_raw(&payload).await
    }

    /// Push an already-encoded payload without touching its bytes.
    pub async fn push_raw(&self, payload: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO queue (payload, enqueued_at) VALUES (?1, ?2)",
            rusqlite::params![payload, now_timestamp()],
        )
        .context("Failed to push task onto queue")?;
        drop(conn);

        self.pushed.notify_one();
        Ok(())
    }

    /// Remove and return the oldest entry, if any.
    pub async fn try_pop(&self) -> Result<Option<QueueEntry>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "DELETE FROM queue WHERE id = (SELECT MIN(id) FROM queue)
             RETURNING id, payload",
            [],
            |row| {
                Ok(QueueEntry {
                    id: row.get(0)?,
                    payload: row.get(1)?,
                })
            },
        )
        .optional()
        .context("Failed to pop task from queue")
    }

    /// Block until an entry is available.
    ///
    /// Pushes from this process wake the consumer immediately; pushes from
    /// other processes sharing the database file are seen on the next poll.
    pub async fn pop(&self, poll_interval: Duration) -> Result<QueueEntry> {
        loop {
            if let Some(entry) = self.try_pop().await? {
                return Ok(entry);
            }
            tokio::select! {
                _ = self.pushed.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    pub async fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))
            .context("Failed to count queue")?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn make_task(message_id: i64) -> Task {
        Task {
            source_id: -100,
            message_id,
            text: format!("message {}", message_id),
            media_path: None,
            target_channel_id: Some("634".to_string()),
            template: Default::default(),
            display_name: "News".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let store = Store::open_in_memory().unwrap();
        let queue = store.queue();

        for id in 1..=3 {
            queue.push(&make_task(id)).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 3);

        for id in 1..=3 {
            let entry = queue.try_pop().await.unwrap().unwrap();
            let task: Task = serde_json::from_str(&entry.payload).unwrap();
            assert_eq!(task.message_id, id);
        }
        assert!(queue.try_pop().await.unwrap().is_none());
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_push_raw_is_verbatim() {
        let store = Store::open_in_memory().unwrap();
        let queue = store.queue();
        let raw = r#"{"chat_id": -1, "msg_id": 2, "text": "中文"}"#;

        queue.push_raw(raw).await.unwrap();
        let entry = queue.try_pop().await.unwrap().unwrap();
        assert_eq!(entry.payload, raw);
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let store = Store::open_in_memory().unwrap();
        let queue = store.queue();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        queue.push(&make_task(9)).await.unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let task: Task = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(task.message_id, 9);
    }
}
