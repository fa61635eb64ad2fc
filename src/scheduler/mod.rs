pub mod tasks;

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// Periodic jobs that run next to the dispatch worker.
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { inner })
    }

    /// Register `job` under a six-field cron expression (seconds first).
    pub async fn add_job<F, Fut>(&self, cron_expr: &str, name: &str, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job_name = name.to_string();
        let job = Arc::new(job);
        let entry = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = (*job)();
            Box::pin(async move {
                debug!("Running scheduled job: {}", name);
                fut.await;
            })
        })
        .with_context(|| format!("Invalid cron expression for job {}: {}", name, cron_expr))?;

        self.inner
            .add(entry)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled job '{}' with cron: {}", name, cron_expr);
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to shut down scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_job_runs_on_schedule() {
        let mut scheduler = Scheduler::new().await.unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler
            .add_job("* * * * * *", "tick", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(runs.load(Ordering::SeqCst) >= 1);
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_cron_is_rejected() {
        let scheduler = Scheduler::new().await.unwrap();
        let err = scheduler
            .add_job("not a cron", "broken", || async {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
