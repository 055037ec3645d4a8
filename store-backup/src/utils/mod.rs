//! Utility modules shared across the pipeline.

pub mod errors;
pub mod fsutil;
pub mod logger;

pub use errors::{BackupError, Result};

/// Run blocking file or catalog work off the async executor.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
