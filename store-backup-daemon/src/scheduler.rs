use crate::state::AppState;
use std::sync::Arc;
use store_backup::TickOutcome;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Cron driver for `ScheduleManager::on_tick`. The interval and retention
/// policy live in the manager; the cron expression only sets how often it
/// is asked.
pub struct TickScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl TickScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule_ticks(&self, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                match state.system.schedule.on_tick().await {
                    Ok(TickOutcome::Completed(record)) => {
                        tracing::info!(backup_id = %record.id, "Scheduled backup completed")
                    }
                    Ok(TickOutcome::Failed(error)) => {
                        tracing::error!(error = %error, "Scheduled backup failed")
                    }
                    Ok(TickOutcome::Busy) => {
                        tracing::warn!("Skipping scheduled run: another operation is in progress")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Scheduler tick failed"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Backup tick scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
