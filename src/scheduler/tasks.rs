use tracing::{info, warn};

use crate::scheduler::Scheduler;
use crate::store::Store;

/// Top of every hour.
pub const STATS_CRON: &str = "0 0 * * * *";

/// Register the built-in periodic jobs.
pub async fn register_builtin_jobs(scheduler: &Scheduler, store: Store) -> anyhow::Result<()> {
    scheduler
        .add_job(STATS_CRON, "stats", move || {
            let store = store.clone();
            async move { log_stats(&store).await }
        })
        .await
}

/// Log the queue and delivery counters.
pub async fn log_stats(store: &Store) {
    match store.stats().await {
        Ok(stats) => info!("Relay stats: {}", stats),
        Err(e) => warn!("Failed to collect relay stats: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_builtin_jobs() {
        let scheduler = Scheduler::new().await.unwrap();
        let store = Store::open_in_memory().unwrap();
        register_builtin_jobs(&scheduler, store.clone()).await.unwrap();
        log_stats(&store).await;
    }
}
