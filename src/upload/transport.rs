use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::debug;

use super::{UploadProgress, UploadState};
use crate::error::{AppError, AppResult};
use crate::types::Locator;

pub const DEFAULT_CHUNK_BYTES: usize = 256 * 1024;

/// Progress sink handed to a transport. Reports are clamped: anything below the
/// last value is ignored and anything above the total is capped, so observers
/// only ever see non-decreasing progress.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<UploadProgress>>,
}

impl ProgressReporter {
    pub fn channel(initial: UploadProgress) -> (Self, watch::Receiver<UploadProgress>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn total(&self) -> u64 { self.tx.borrow().total_bytes }

    pub fn report(&self, bytes_transferred: u64) {
        self.tx.send_if_modified(|p| {
            let v = bytes_transferred.min(p.total_bytes);
            if p.state != UploadState::Transferring || v <= p.bytes_transferred {
                return false;
            }
            p.bytes_transferred = v;
            true
        });
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut UploadProgress)) { self.tx.send_modify(f); }
}

/// Moves bytes to blob storage and returns a stable locator for them.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    async fn put(&self, bytes: &[u8], path: &str, progress: &ProgressReporter) -> AppResult<Locator>;
}

/// Writes blobs under a root directory in fixed-size chunks, reporting after
/// each chunk. Data lands in `<path>.part` and is renamed into place once
/// complete, so a failed transfer leaves no blob behind.
pub struct FsBlobTransport {
    root: PathBuf,
    chunk_bytes: usize,
}

impl FsBlobTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into(), chunk_bytes: DEFAULT_CHUNK_BYTES } }

    pub fn with_chunk_bytes(mut self, n: usize) -> Self {
        self.chunk_bytes = n.max(1);
        self
    }

    fn resolve(&self, path: &str) -> AppResult<PathBuf> {
        let rel = Path::new(path);
        let clean = !path.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(AppError::transfer("invalid_blob_path".to_string(), format!("refusing blob path '{}'", path)));
        }
        Ok(self.root.join(rel))
    }
}

fn write_failed(path: &Path, e: std::io::Error) -> AppError {
    AppError::transfer("blob_write_failed".to_string(), format!("{}: {}", path.display(), e))
}

#[async_trait]
impl BlobTransport for FsBlobTransport {
    async fn put(&self, bytes: &[u8], path: &str, progress: &ProgressReporter) -> AppResult<Locator> {
        let dest = self.resolve(path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| write_failed(parent, e))?;
        }
        let part = dest.with_extension("part");
        let result = async {
            let mut file = tokio::fs::File::create(&part).await?;
            let mut sent = 0u64;
            for chunk in bytes.chunks(self.chunk_bytes) {
                file.write_all(chunk).await?;
                sent += chunk.len() as u64;
                progress.report(sent);
            }
            file.flush().await?;
            file.sync_all().await?;
            tokio::fs::rename(&part, &dest).await
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(write_failed(&dest, e));
        }
        debug!(target: "dataroom::upload", "blob written path={} bytes={}", path, bytes.len());
        Ok(Locator::new(format!("blob://{}", path)))
    }
}
