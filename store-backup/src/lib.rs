//! Store Backup Library
//!
//! Consistent backups of the store database and crash-safe restores that are
//! staged now and applied at the next startup.

pub mod catalog;
pub mod checksum;
pub mod config;
pub mod events;
pub mod lock;
pub mod restore;
pub mod schedule;
pub mod service;
pub mod source;
pub mod system;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use catalog::{BackupHealth, BackupRecord, BackupStore, BackupTrigger, HealthStatus};
pub use checksum::ChecksumEngine;
pub use config::Config;
pub use events::{BackupEvent, EventBus};
pub use lock::{OperationKind, OperationLock};
pub use restore::{
    DiagnosticReport, DiagnosticsReporter, EmergencyCleanup, RestoreCoordinator, RestoreIntent,
    StartupOutcome, StartupRestoreProcessor,
};
pub use schedule::{ScheduleManager, TickOutcome};
pub use service::BackupService;
pub use system::BackupSystem;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
