//! Directory transport: zstd-compressed copies into a mounted sync folder.

use futures_util::future::BoxFuture;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::RemoteTransport;
use crate::utils::{blocking, fsutil, BackupError, Result};

const ZSTD_LEVEL: i32 = 3;

pub struct DirTransport {
    root: PathBuf,
}

impl DirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn compress_into(src: &Path, dest: &Path) -> std::io::Result<()> {
    let temp = fsutil::temp_path_for(dest);
    let reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(&temp)?);
    zstd::stream::copy_encode(reader, &mut writer, ZSTD_LEVEL)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    std::fs::rename(&temp, dest)?;
    fsutil::sync_parent(dest);
    Ok(())
}

fn decompress_into(src: &Path, dest: &Path) -> std::io::Result<()> {
    let reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dest)?);
    zstd::stream::copy_decode(reader, &mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

impl RemoteTransport for DirTransport {
    fn upload<'a>(&'a self, local: &'a Path, name: &'a str) -> BoxFuture<'a, Result<String>> {
        let root = self.root.clone();
        let local = local.to_path_buf();
        let target = root.join(format!("{name}.zst"));
        Box::pin(async move {
            blocking(move || {
                std::fs::create_dir_all(&root)?;
                compress_into(&local, &target).map_err(|e| {
                    let _ = std::fs::remove_file(fsutil::temp_path_for(&target));
                    BackupError::Transport(format!("copy to {}: {e}", target.display()))
                })?;
                let absolute = std::fs::canonicalize(&target)?;
                Ok(absolute.to_string_lossy().into_owned())
            })
            .await
        })
    }

    fn download<'a>(&'a self, remote_ref: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<()>> {
        let src = PathBuf::from(remote_ref);
        let dest = dest.to_path_buf();
        Box::pin(async move {
            blocking(move || {
                if !src.exists() {
                    return Err(BackupError::NotFound(format!(
                        "remote artifact {}",
                        src.display()
                    )));
                }
                decompress_into(&src, &dest).map_err(|e| {
                    let _ = std::fs::remove_file(&dest);
                    BackupError::Transport(format!("fetch {}: {e}", src.display()))
                })
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upload_then_download() -> Result<()> {
        let dir = tempdir()?;
        let local = dir.path().join("b1.db");
        let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        std::fs::write(&local, &payload)?;

        let transport = DirTransport::new(dir.path().join("remote"));
        let remote_ref = transport.upload(&local, "b1.db").await?;
        assert!(remote_ref.ends_with("b1.db.zst"));

        let fetched = dir.path().join("fetched.db");
        transport.download(&remote_ref, &fetched).await?;
        assert_eq!(std::fs::read(&fetched)?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn test_download_missing_ref() {
        let dir = tempdir().unwrap();
        let transport = DirTransport::new(dir.path());
        let result = transport
            .download("/no/such/artifact.zst", &dir.path().join("out"))
            .await;
        assert!(matches!(result, Err(BackupError::NotFound(_))));
    }
}
