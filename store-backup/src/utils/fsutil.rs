//! Filesystem primitives shared by the backup and restore paths.
//!
//! Every crash-relevant state change goes through [`atomic_write`] or a plain
//! `rename`: the new content is written and fsynced under a temporary name,
//! then renamed over the target so readers observe either the old or the new
//! file in full.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::errors::is_transient_io;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Temporary sibling used while writing `path` atomically.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Append a suffix to the full file name (`store.db` + `-wal` -> `store.db-wal`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Write `data` to `path` via temp file + fsync + rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_path_for(path);

    let result = write_then_rename(&temp, path, data);
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn write_then_rename(temp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp, path)?;
    sync_parent(path);
    Ok(())
}

/// Copy `src` to `dst` and fsync the destination. Returns the bytes copied.
pub fn copy_durable(src: &Path, dst: &Path) -> io::Result<u64> {
    let copied = fs::copy(src, dst)?;
    File::options().write(true).open(dst)?.sync_all()?;
    Ok(copied)
}

/// Best effort fsync of the directory holding `path`, making a rename durable.
pub fn sync_parent(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run `op`, retrying errors `transient` accepts with exponential backoff.
///
/// `max_retries` counts retries after the first attempt.
pub fn retry_when<T, E, F, P>(what: &str, max_retries: u32, transient: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && transient(&e) => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                attempt += 1;
                tracing::warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient I/O error, retrying"
                );
                thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn retry_io<T, F>(what: &str, max_retries: u32, op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    retry_when(what, max_retries, is_transient_io, op)
}

/// Whether a rename failed because source and target are on different devices.
pub fn is_cross_device(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::CrossesDevices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_replaces_content() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("intent.json");

        atomic_write(&path, b"first")?;
        atomic_write(&path, b"second")?;

        assert_eq!(fs::read(&path)?, b"second");
        assert!(!temp_path_for(&path).exists());
        Ok(())
    }

    #[test]
    fn test_remove_if_exists_is_idempotent() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("gone");
        fs::write(&path, b"x")?;

        assert!(remove_if_exists(&path)?);
        assert!(!remove_if_exists(&path)?);
        Ok(())
    }

    #[test]
    fn test_cross_device_detection() {
        assert!(is_cross_device(&io::Error::from(io::ErrorKind::CrossesDevices)));
        assert!(!is_cross_device(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_exdev_is_cross_device() {
        // EXDEV
        assert!(is_cross_device(&io::Error::from_raw_os_error(18)));
    }

    #[test]
    fn test_retry_io_gives_up_on_permanent_error() {
        let calls = Cell::new(0);
        let result: io::Result<()> = retry_io("test", 3, || {
            calls.set(calls.get() + 1);
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retry_io_recovers_from_transient_error() {
        let calls = Cell::new(0);
        let result = retry_io("test", 3, || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(io::Error::new(io::ErrorKind::Interrupted, "eintr"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_with_suffix() {
        let p = Path::new("/data/store.db");
        assert_eq!(with_suffix(p, "-wal"), PathBuf::from("/data/store.db-wal"));
    }
}
