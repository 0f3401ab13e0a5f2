// src/core/services/local_fs.rs

//! A real file-system service backed by tokio::fs.
//!
//! Files are opened append-only under a base directory; AUTO_SYNC issues an
//! fsync once the configured number of unsynced bytes accumulates, and close
//! always syncs before returning. DIRECT_IO and COMPRESSED are accepted and
//! recorded but not acted upon here: direct I/O is a platform concern and
//! compression is applied by the restore-side tooling chain.

use super::{FileSystem, FsOpenFlags, FsOpenReq};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct OpenFile {
    file: File,
    path: PathBuf,
    sync_size: usize,
    unsynced: usize,
}

pub struct LocalFileSystem {
    base_dir: PathBuf,
    next_handle: AtomicU64,
    open_files: DashMap<u64, Arc<Mutex<OpenFile>>>,
}

impl LocalFileSystem {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            next_handle: AtomicU64::new(1),
            open_files: DashMap::new(),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn open(&self, req: FsOpenReq) -> io::Result<u64> {
        let path = self.resolve(&req.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = OpenOptions::new();
        options.write(req.flags.contains(FsOpenFlags::WRITE_ONLY));
        options.create(req.flags.contains(FsOpenFlags::CREATE_IF_NONE));
        options.append(req.flags.contains(FsOpenFlags::APPEND));
        let file = options.open(&path).await?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let sync_size = if req.flags.contains(FsOpenFlags::AUTO_SYNC) {
            req.sync_size
        } else {
            usize::MAX
        };
        self.open_files.insert(
            handle,
            Arc::new(Mutex::new(OpenFile {
                file,
                path,
                sync_size,
                unsynced: 0,
            })),
        );
        debug!("opened backup file {} as handle {}", req.name, handle);
        Ok(handle)
    }

    async fn append(&self, handle: u64, data: Bytes) -> io::Result<()> {
        let entry = self
            .open_files
            .get(&handle)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown file handle"))?;
        let mut open = entry.lock().await;
        open.file.write_all(&data).await?;
        open.unsynced += data.len();
        if open.unsynced >= open.sync_size {
            open.file.sync_data().await?;
            open.unsynced = 0;
        }
        Ok(())
    }

    async fn close(&self, handle: u64, remove: bool) -> io::Result<()> {
        let (_, entry) = self
            .open_files
            .remove(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown file handle"))?;
        let mut open = entry.lock().await;
        open.file.sync_all().await?;
        if remove {
            let path = open.path.clone();
            drop(open);
            warn!("removing errored backup file {}", path.display());
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> io::Result<()> {
        tokio::fs::remove_file(self.resolve(name)).await
    }
}
