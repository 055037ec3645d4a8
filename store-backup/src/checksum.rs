//! SHA-256 content checksums for backup artifacts and staged restores.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::utils::{BackupError, Result};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Computes and verifies full-content digests of files.
///
/// Digests are lowercase hex SHA-256 (64 characters). The whole file is
/// always read; there is no sampling shortcut.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumEngine;

impl ChecksumEngine {
    pub fn new() -> Self {
        Self
    }

    /// Hash the full content of `path`.
    pub fn compute(&self, path: &Path) -> Result<String> {
        hash_file(path).map_err(|source| BackupError::ChecksumCompute {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Recompute and compare. A mismatch is `Ok(false)`; only an unreadable
    /// file is an error.
    pub fn verify(&self, path: &Path, expected: &str) -> Result<bool> {
        let actual = self.compute(path)?;
        Ok(actual.eq_ignore_ascii_case(expected))
    }

    /// Like [`verify`](Self::verify) but turns a mismatch into
    /// [`BackupError::ChecksumMismatch`].
    pub fn ensure(&self, path: &Path, expected: &str) -> Result<()> {
        let actual = self.compute(path)?;
        if actual.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(BackupError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: expected.to_string(),
                actual,
            })
        }
    }
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(READ_BUF_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
