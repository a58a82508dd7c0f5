//! SHA-256 content checksums sent with every upload.

use crate::{Result, SyncError};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hex encoded SHA-256 of the file at `path`.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let local_file = |source| SyncError::LocalFile {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(local_file)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).await.map_err(local_file)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_known_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let checksum = sha256_file(file.path()).await.unwrap();
        assert_eq!(
            checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = sha256_file(&dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, SyncError::LocalFile { .. }));
    }
}
