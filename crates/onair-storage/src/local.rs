//! Local filesystem primitives used by ingestion and the pipeline.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{StorageError, StorageResult};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Create `path` as an empty file, truncating nothing if it already exists.
pub async fn create_empty(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| {
            StorageError::WriteFailed(format!("Failed to create {}: {}", path.display(), e))
        })?;
    Ok(())
}

/// Append at most `max_bytes` from `reader` to `path`, reading `read_size` bytes at a
/// time. Returns the number of bytes appended.
///
/// Bytes already written stay on disk when the reader fails midway; callers recompute
/// the watermark with [`file_size`] rather than trusting the return value alone.
pub async fn append_from_reader<R>(
    path: &Path,
    reader: &mut R,
    max_bytes: u64,
    read_size: usize,
) -> StorageResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let start = Instant::now();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| {
            StorageError::WriteFailed(format!("Failed to open {}: {}", path.display(), e))
        })?;

    let mut buf = vec![0u8; read_size.max(1)];
    let mut remaining = max_bytes;
    let mut written: u64 = 0;

    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await.map_err(|e| {
            StorageError::WriteFailed(format!("Failed to append to {}: {}", path.display(), e))
        })?;
        remaining -= n as u64;
        written += n as u64;
    }

    file.flush().await?;
    file.sync_data().await?;

    tracing::debug!(
        path = %path.display(),
        bytes_written = written,
        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Appended chunk"
    );

    Ok(written)
}

/// Size of the file at `path`.
pub async fn file_size(path: &Path) -> StorageResult<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(StorageError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Move `src` to `dst` with a single rename, replacing any existing file.
///
/// Both paths must be on the same filesystem; there is no copy fallback, so a reader
/// of `dst` sees either the old file or the complete new one.
pub async fn atomic_publish(src: &Path, dst: &Path) -> StorageResult<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(src, dst).await.map_err(|e| {
        StorageError::PublishFailed(format!(
            "Failed to rename {} to {}: {}",
            src.display(),
            dst.display(),
            e
        ))
    })?;

    tracing::info!(
        src = %src.display(),
        dst = %dst.display(),
        "Published file"
    );
    Ok(())
}

/// Remove `path`. Returns false when there was nothing to remove.
pub async fn remove_if_exists(path: &Path) -> StorageResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Lower-case hex SHA-256 of the file at `path`.
pub async fn sha256_file(path: &Path) -> StorageResult<String> {
    let mut file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StorageError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
