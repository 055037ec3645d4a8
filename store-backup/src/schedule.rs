//! Interval and retention policy driving `BackupService`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::{BackupRecord, BackupStore, BackupTrigger};
use crate::config::ScheduleConfig;
use crate::events::{BackupEvent, EventBus};
use crate::service::BackupService;
use crate::utils::{blocking, BackupError, Result};

/// What a scheduler tick did.
#[derive(Debug)]
pub enum TickOutcome {
    Disabled,
    NotDue { next_due: DateTime<Utc> },
    /// Another backup or a restore staging holds the lock; try next tick.
    Busy,
    Completed(BackupRecord),
    /// The backup failed. Already logged and reflected in health.
    Failed(String),
}

/// Whether a scheduled backup is due given the last complete backup time.
pub fn is_due(last_backup_at: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last_backup_at {
        None => true,
        Some(last) => match chrono::Duration::from_std(interval) {
            Ok(interval) => now.signed_duration_since(last) >= interval,
            Err(_) => false,
        },
    }
}

pub struct ScheduleManager {
    service: Arc<BackupService>,
    store: Arc<BackupStore>,
    events: EventBus,
    config: RwLock<ScheduleConfig>,
}

impl ScheduleManager {
    pub fn new(
        service: Arc<BackupService>,
        store: Arc<BackupStore>,
        events: EventBus,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            service,
            store,
            events,
            config: RwLock::new(config),
        }
    }

    pub async fn config(&self) -> ScheduleConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, config: ScheduleConfig) -> Result<()> {
        if config.interval_secs == 0 {
            return Err(BackupError::Config("schedule.interval_secs must be > 0".into()));
        }
        if config.retention_count == 0 {
            return Err(BackupError::Config("schedule.retention_count must be > 0".into()));
        }
        info!(
            enabled = config.enabled,
            interval_secs = config.interval_secs,
            retention = config.retention_count,
            "[Schedule] Config updated"
        );
        *self.config.write().await = config;
        Ok(())
    }

    /// Periodic entry point. Runs a scheduled backup when due, prunes after
    /// a successful one, and retries deferred uploads.
    pub async fn on_tick(&self) -> Result<TickOutcome> {
        let config = self.config().await;
        if !config.enabled {
            return Ok(TickOutcome::Disabled);
        }

        let store = Arc::clone(&self.store);
        let latest = blocking(move || store.latest_complete()).await?;
        let last_at = latest.map(|r| r.created_at);
        let now = Utc::now();

        let outcome = if is_due(last_at, now, config.interval()) {
            match self.service.create_backup(BackupTrigger::Scheduled).await {
                Ok(record) => {
                    self.prune_logged(config.retention_count).await;
                    TickOutcome::Completed(record)
                }
                Err(BackupError::OperationInProgress(kind)) => {
                    debug!(running = %kind, "[Schedule] Skipping tick, operation in progress");
                    TickOutcome::Busy
                }
                Err(e) => TickOutcome::Failed(e.to_string()),
            }
        } else {
            let next_due = last_at.unwrap_or(now)
                + chrono::Duration::seconds(config.interval_secs as i64);
            TickOutcome::NotDue { next_due }
        };

        match self.service.retry_pending_uploads().await {
            Ok(0) => {}
            Ok(n) => info!(uploaded = n, "[Schedule] Deferred uploads completed"),
            Err(e) => warn!(error = %e, "[Schedule] Retrying deferred uploads failed"),
        }

        Ok(outcome)
    }

    /// Manual trigger: no interval check, same mutual exclusion.
    pub async fn run_now(&self) -> Result<BackupRecord> {
        let record = self.service.create_backup(BackupTrigger::Manual).await?;
        let retention = self.config.read().await.retention_count;
        self.prune_logged(retention).await;
        Ok(record)
    }

    /// Apply retention and report removed ids.
    pub async fn prune(&self, retention_count: usize) -> Result<Vec<String>> {
        let store = Arc::clone(&self.store);
        let removed = blocking(move || store.prune(retention_count)).await?;
        if !removed.is_empty() {
            self.events.emit(BackupEvent::RetentionPruned {
                removed: removed.clone(),
            });
        }
        Ok(removed)
    }

    async fn prune_logged(&self, retention_count: usize) {
        if let Err(e) = self.prune(retention_count).await {
            warn!(error = %e, "[Retention] Pruning failed, backups kept");
        }
    }
}
