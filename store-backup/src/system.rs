//! Wiring of the pipeline components around one configuration.

use std::sync::Arc;
use tracing::info;

use crate::catalog::BackupStore;
use crate::config::Config;
use crate::events::EventBus;
use crate::lock::OperationLock;
use crate::restore::intent::IntentFile;
use crate::restore::{
    DiagnosticsReporter, EmergencyCleanup, RestoreCoordinator, StartupOutcome,
    StartupRestoreProcessor,
};
use crate::schedule::ScheduleManager;
use crate::service::BackupService;
use crate::source::{self, DataSource};
use crate::transport;
use crate::utils::Result;

/// Every component sharing one store, lock and event bus.
pub struct BackupSystem {
    pub config: Config,
    pub events: EventBus,
    pub lock: OperationLock,
    pub store: Arc<BackupStore>,
    pub source: Arc<dyn DataSource>,
    pub service: Arc<BackupService>,
    pub schedule: Arc<ScheduleManager>,
    pub coordinator: Arc<RestoreCoordinator>,
}

impl BackupSystem {
    /// Apply any pending restore, then open the live data. The live file is
    /// not opened until the processor has finished.
    pub fn boot(config: Config) -> Result<(Self, StartupOutcome)> {
        config.ensure_dirs()?;
        let events = EventBus::new();
        let outcome = StartupRestoreProcessor::new(&config)
            .with_events(events.clone())
            .process_pending_restore()?;
        info!(?outcome, "[Startup] Restore check finished");
        let system = Self::open_with_events(config, events)?;
        Ok((system, outcome))
    }

    /// Open without running the startup processor. Callers must ensure the
    /// processor already ran in this process or another one.
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open_with_events(config, EventBus::new())
    }

    fn open_with_events(config: Config, events: EventBus) -> Result<Self> {
        let lock = OperationLock::new();
        let store = Arc::new(BackupStore::from_config(&config)?);
        let source = source::open(&config)?;
        let remote = match &config.remote {
            Some(remote) => Some(transport::from_config(remote)?),
            None => None,
        };

        let service = Arc::new(
            BackupService::new(
                Arc::clone(&source),
                Arc::clone(&store),
                lock.clone(),
                events.clone(),
                config.backup.dir.clone(),
            )
            .with_transport(remote.clone())
            .with_io_retries(config.backup.max_io_retries),
        );
        let schedule = Arc::new(ScheduleManager::new(
            Arc::clone(&service),
            Arc::clone(&store),
            events.clone(),
            config.schedule.clone(),
        ));
        let coordinator = Arc::new(
            RestoreCoordinator::new(
                Arc::clone(&store),
                IntentFile::new(&config.restore.intent_path),
                config.restore.staging_dir.clone(),
                lock.clone(),
                events.clone(),
            )
            .with_transport(remote)
            .with_io_retries(config.backup.max_io_retries),
        );

        Ok(Self {
            config,
            events,
            lock,
            store,
            source,
            service,
            schedule,
            coordinator,
        })
    }

    pub fn diagnostics(&self) -> DiagnosticsReporter {
        DiagnosticsReporter::new(&self.config, Some(Arc::clone(&self.store)))
    }

    pub fn emergency(&self) -> EmergencyCleanup {
        EmergencyCleanup::new(&self.config).with_events(self.events.clone())
    }

    /// Release the live data source and the catalog.
    pub fn close(&self) {
        self.source.close();
        self.store.close();
    }
}
