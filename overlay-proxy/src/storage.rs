//! Storage-engine seam for content bags.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use overlay_core::{ContentId, FileSpan};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("bag {0} is not available")]
    NotFound(String),
    #[error("piece {index}: {reason}")]
    Piece { index: u32, reason: String },
    #[error("bag closed")]
    Closed,
    #[error("io: {0}")]
    Io(String),
}

/// Opens bags by content id.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn open(&self, id: &ContentId) -> Result<Arc<dyn Downloader>, StorageError>;
}

/// An opened bag: file index plus piece fetch.
#[async_trait]
pub trait Downloader: Send + Sync {
    fn piece_size(&self) -> u32;

    /// Where `path` lives inside the bag, or None if the bag has no such file.
    fn file_offsets(&self, path: &str) -> Option<FileSpan>;

    /// Fetch one whole piece. The last piece of a bag may be short.
    async fn download_piece(&self, index: u32) -> Result<Bytes, StorageError>;

    /// Release the bag. Later downloads fail.
    fn close(&self);
}
