//! Bags served from local directories: files sorted by relative path, concatenated,
//! split into fixed-size pieces.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use overlay_core::{ContentId, FileSpan};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::config::BagEntry;
use crate::directory::{parse_hex32, TableError};
use crate::storage::{Downloader, StorageEngine, StorageError};

#[derive(Default)]
pub struct LocalStorage {
    bags: HashMap<ContentId, (PathBuf, u32)>,
}

impl LocalStorage {
    pub fn from_config(entries: &[BagEntry]) -> Result<Self, TableError> {
        let mut storage = Self::default();
        for e in entries {
            let id = parse_hex32(&e.id).map_err(|r| TableError::new(&e.id, r))?;
            storage.insert(ContentId(id), e.dir.clone(), e.piece_size);
        }
        Ok(storage)
    }

    pub fn insert(&mut self, id: ContentId, dir: PathBuf, piece_size: u32) {
        self.bags.insert(id, (dir, piece_size.max(1)));
    }
}

#[async_trait]
impl StorageEngine for LocalStorage {
    async fn open(&self, id: &ContentId) -> Result<Arc<dyn Downloader>, StorageError> {
        let (dir, piece_size) = self
            .bags
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_hex()))?;
        let files = tokio::task::spawn_blocking(move || scan(&dir))
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?
            .map_err(|e| StorageError::Io(e.to_string()))?;
        debug!(bag = %id.to_hex(), files = files.len(), "bag indexed");
        Ok(Arc::new(LocalBag::new(files, piece_size)))
    }
}

struct LocalFile {
    name: String,
    path: PathBuf,
    offset: u64,
    size: u64,
}

/// Regular files under `root`, sorted by relative path.
fn scan(root: &Path) -> std::io::Result<Vec<(String, PathBuf, u64)>> {
    let mut out = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let kind = entry.file_type()?;
            let path = entry.path();
            if kind.is_dir() {
                dirs.push(path);
            } else if kind.is_file() {
                let Ok(rel) = path.strip_prefix(root) else {
                    continue;
                };
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((name, path.clone(), entry.metadata()?.len()));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

pub struct LocalBag {
    files: Vec<LocalFile>,
    total: u64,
    piece_size: u32,
    closed: AtomicBool,
}

impl LocalBag {
    fn new(entries: Vec<(String, PathBuf, u64)>, piece_size: u32) -> Self {
        let mut offset = 0;
        let files = entries
            .into_iter()
            .map(|(name, path, size)| {
                let f = LocalFile {
                    name,
                    path,
                    offset,
                    size,
                };
                offset += size;
                f
            })
            .collect();
        Self {
            files,
            total: offset,
            piece_size,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Downloader for LocalBag {
    fn piece_size(&self) -> u32 {
        self.piece_size
    }

    fn file_offsets(&self, path: &str) -> Option<FileSpan> {
        self.files
            .iter()
            .find(|f| f.name == path)
            .map(|f| FileSpan::locate(f.offset, f.size, self.piece_size))
    }

    async fn download_piece(&self, index: u32) -> Result<Bytes, StorageError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(StorageError::Closed);
        }
        let start = index as u64 * self.piece_size as u64;
        if start >= self.total {
            return Err(StorageError::Piece {
                index,
                reason: "beyond end of bag".into(),
            });
        }
        let end = (start + self.piece_size as u64).min(self.total);
        let mut piece = BytesMut::with_capacity((end - start) as usize);
        for f in &self.files {
            let (f_start, f_end) = (f.offset, f.offset + f.size);
            if f_end <= start || f_start >= end || f.size == 0 {
                continue;
            }
            let from = start.max(f_start);
            let to = end.min(f_end);
            let mut buf = vec![0u8; (to - from) as usize];
            let piece_err = |e: std::io::Error| StorageError::Piece {
                index,
                reason: format!("{}: {e}", f.name),
            };
            let mut file = tokio::fs::File::open(&f.path).await.map_err(piece_err)?;
            file.seek(SeekFrom::Start(from - f_start))
                .await
                .map_err(piece_err)?;
            file.read_exact(&mut buf).await.map_err(piece_err)?;
            piece.extend_from_slice(&buf);
        }
        Ok(piece.freeze())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
