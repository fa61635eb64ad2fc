pub mod classify;
pub mod media;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::pipeline::{self, Normalizer};
use crate::qq::{ApiResponse, QqApi, SessionGate};
use crate::store::queue::QueueEntry;
use crate::store::{DeadLetterStore, ProcessedLedger, Store, TaskQueue};
use crate::task::{self, Task};
pub use classify::{classify, ErrorClass, SendFailure};

/// What happened to one queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Carries the dead letter id.
    DeadLettered(i64),
}

/// Single consumer of the task queue.
///
/// Every entry ends either as a processed record or as a dead letter; a
/// failing task never stops the loop.
pub struct DispatchWorker {
    queue: TaskQueue,
    processed: ProcessedLedger,
    dead_letters: DeadLetterStore,
    api: Arc<QqApi>,
    gate: Arc<dyn SessionGate>,
    normalizer: Normalizer,
    static_channel: Option<String>,
    config: WorkerConfig,
}

impl DispatchWorker {
    pub fn new(
        store: &Store,
        api: Arc<QqApi>,
        gate: Arc<dyn SessionGate>,
        normalizer: Normalizer,
        static_channel: Option<String>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue: store.queue(),
            processed: store.processed(),
            dead_letters: store.dead_letters(),
            api,
            gate,
            normalizer,
            static_channel,
            config,
        }
    }

    /// Consume the queue until `shutdown` fires. Shutdown is observed between
    /// tasks; an in-flight send always completes.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Dispatch worker started (channel: {}, send interval {:?})",
            self.static_channel.as_deref().unwrap_or("per task"),
            self.config.send_interval()
        );

        loop {
            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.queue.pop(self.config.queue_poll_interval()) => popped,
            };

            match popped {
                Ok(entry) => {
                    if let Err(e) = self.process(&entry).await {
                        error!("Failed to record outcome of queue entry {}: {:#}", entry.id, e);
                    }
                    // Pace completions, successful or not.
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.send_interval()) => {}
                    }
                }
                Err(e) => {
                    error!("Queue pop failed: {:#}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.queue_poll_interval()) => {}
                    }
                }
            }
        }

        info!("Dispatch worker stopped");
    }

    /// Send one popped entry and record the result.
    ///
    /// Errors are returned only when the outcome could not be persisted.
    pub async fn process(&self, entry: &QueueEntry) -> Result<Outcome> {
        let task: Task = match serde_json::from_str(&entry.payload) {
            Ok(task) => task,
            Err(e) => {
                let (source_id, message_id) = task::raw_identity(&entry.payload);
                let id = self
                    .dead_letters
                    .save(
                        source_id,
                        message_id,
                        &format!("undecodable task: {}", e),
                        &entry.payload,
                    )
                    .await?;
                warn!("Queue entry {} is not a task, dead letter {}: {}", entry.id, id, e);
                return Ok(Outcome::DeadLettered(id));
            }
        };
        let (source_id, message_id) = task.identity();

        let Some(channel) = self
            .static_channel
            .clone()
            .or_else(|| task.target_channel_id.clone())
        else {
            return self
                .dead_letter(
                    &task,
                    entry,
                    "no target channel: set qq.target_channel_id, qq.target_guild_id or a per-source channel",
                )
                .await;
        };

        let content = pipeline::render(&task, &self.normalizer);
        debug!(
            "Dispatching source_id={} message_id={} to channel {}",
            source_id, message_id, channel
        );

        let mut result = self.send_ladder(&channel, &content, &task).await;
        if let Err(failure) = &result {
            let class = classify(failure);
            if class != ErrorClass::Other {
                self.recover(class, failure).await;
                result = self.send_ladder(&channel, &content, &task).await;
            }
        }

        match result {
            Ok(()) => {
                self.processed.mark_processed(source_id, message_id).await?;
                info!(
                    "Sent source_id={} message_id={} channel_id={}",
                    source_id, message_id, channel
                );
                Ok(Outcome::Sent)
            }
            Err(failure) => self.dead_letter(&task, entry, &failure.to_string()).await,
        }
    }

    async fn dead_letter(&self, task: &Task, entry: &QueueEntry, reason: &str) -> Result<Outcome> {
        let id = self
            .dead_letters
            .save(task.source_id, task.message_id, reason, &entry.payload)
            .await?;
        error!(
            "Send failed, dead letter {}: source_id={} message_id={} error={}",
            id, task.source_id, task.message_id, reason
        );
        Ok(Outcome::DeadLettered(id))
    }

    /// One recovery cycle before the second and final attempt.
    async fn recover(&self, class: ErrorClass, failure: &SendFailure) {
        warn!("Send failed ({:?}), retrying once after recovery: {}", class, failure);

        let tokens = self.api.tokens();
        let status = tokens.status().await;
        info!(
            "Token status before recovery: manual={} cached={} expires_in={}s last_refresh_at={} last_error={} gateway_ready={} gateway_error={}",
            status.has_manual_token,
            status.has_cached_token,
            status.expires_in_secs,
            status.last_refresh_at.as_deref().unwrap_or("-"),
            status.last_refresh_error.as_deref().unwrap_or("-"),
            self.gate.is_ready(),
            self.gate.last_error().as_deref().unwrap_or("-")
        );

        // A failed refresh keeps the cached token, so the retry still happens.
        if let Err(e) = tokens.get_token(true).await {
            warn!("Forced token refresh failed: {:#}", e);
        }
        let timeout = self.config.ready_timeout();
        if !self.gate.wait_until_ready(timeout).await {
            warn!("Gateway not ready after {:?}, retrying anyway", timeout);
        }
    }

    /// Image with text, then a recompressed image with text, then text only.
    /// Tasks without media go straight to text.
    async fn send_ladder(&self, channel: &str, content: &str, task: &Task) -> Result<(), SendFailure> {
        if let Some(image_path) = task.media_path.as_deref().filter(|p| !p.is_empty()) {
            let original = Path::new(image_path);
            match settle(self.api.send_with_image(channel, content, original).await) {
                Ok(()) => return Ok(()),
                Err(f) => debug!("Image send failed, recompressing: {}", f),
            }

            match media::compress_image(original, self.config.max_image_bytes).await {
                Ok(compressed) => {
                    let sent = settle(self.api.send_with_image(channel, content, &compressed).await);
                    if let Err(e) = tokio::fs::remove_file(&compressed).await {
                        debug!("Failed to remove {}: {}", compressed.display(), e);
                    }
                    match sent {
                        Ok(()) => return Ok(()),
                        Err(f) => debug!("Recompressed image send failed: {}", f),
                    }
                }
                Err(e) => debug!("Image recompression skipped: {:#}", e),
            }

            warn!("Falling back to text only for message {}", task.message_id);
        }

        settle(self.api.send_text(channel, content).await)
    }
}

fn settle(result: Result<ApiResponse>) -> Result<(), SendFailure> {
    match result {
        Ok(response) if response.is_success() => Ok(()),
        Ok(response) => Err(SendFailure::Http {
            status: response.status,
            body: response.body,
        }),
        Err(e) => Err(SendFailure::Transport(format!("{:#}", e))),
    }
}
