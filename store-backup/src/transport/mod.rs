//! Remote transport collaborator: an opaque place to ship artifacts to and
//! fetch them back from. Failures here never fail a local backup.

pub mod dir;
pub mod http;

use futures_util::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RemoteConfig, RemoteKind};
use crate::utils::{BackupError, Result};

pub use dir::DirTransport;
pub use http::HttpTransport;

pub trait RemoteTransport: Send + Sync {
    /// Ship `local` under `name`; returns the remote reference to store.
    fn upload<'a>(&'a self, local: &'a Path, name: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Fetch `remote_ref` into `dest` (which must not be relied on until this returns Ok).
    fn download<'a>(&'a self, remote_ref: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<()>>;
}

pub fn from_config(remote: &RemoteConfig) -> Result<Arc<dyn RemoteTransport>> {
    match remote.kind {
        RemoteKind::Http => {
            let url = remote
                .url
                .clone()
                .ok_or_else(|| BackupError::Config("remote.url is required for http".into()))?;
            Ok(Arc::new(HttpTransport::new(
                url,
                remote.token.clone(),
                Duration::from_secs(remote.timeout_secs),
            )?))
        }
        RemoteKind::Dir => {
            let dir = remote
                .dir
                .clone()
                .ok_or_else(|| BackupError::Config("remote.dir is required for dir".into()))?;
            Ok(Arc::new(DirTransport::new(dir)))
        }
    }
}
