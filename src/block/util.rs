//! Administrative utility for whole-file maintenance of the block store.
//!
//! Imports, deletions and wholesale clears funnel through a background
//! worker so they serialise with each other instead of interleaving their
//! transactions. Exports and existence probes read directly. None of these
//! operations coordinate with open descriptors; callers run them while the
//! file is closed.

use byteorder::{BigEndian, ByteOrder};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::kv::{Database, Durability, Key, KvError, MetadataRow, Row, TxMode};
use crate::vfs::{path as uri, VfsError, VfsResult};

use super::coalesce::Coalescer;
use super::store;
use super::{new_generation, valid_block_size};

enum Job {
    Apply { rows: Vec<Row>, done: oneshot::Sender<Result<(), KvError>> },
    Delete { path: String, done: oneshot::Sender<Result<(), KvError>> },
    Clear { done: oneshot::Sender<Result<(), KvError>> },
}

/// Maintenance handle over one database. Dropping it stops the worker once
/// queued jobs drain.
pub struct BlockStoreAdmin {
    db: Database,
    jobs: async_channel::Sender<Job>,
    worker: JoinHandle<()>,
}

impl BlockStoreAdmin {
    /// Spawn the maintenance worker. Must be called within a runtime.
    pub fn new(db: Database) -> BlockStoreAdmin {
        let (jobs, rx) = async_channel::unbounded();
        let worker_db = db.clone();
        let worker = tokio::spawn(async move { run(worker_db, rx).await });
        BlockStoreAdmin { db, jobs, worker }
    }

    /// Stop the worker after queued jobs drain.
    pub async fn shutdown(self) {
        drop(self.jobs);
        let _ = self.worker.await;
    }

    /// Whether a file exists under `path`.
    pub async fn exists(&self, path: &str) -> VfsResult<bool> {
        let path = uri::normalize(path)?;
        let mut co = Coalescer::new(self.db.clone(), Durability::Relaxed);
        match store::load_metadata(&mut co, &path) {
            Ok(meta) => Ok(meta.is_some()),
            Err(_) => Err(VfsError::Io),
        }
    }

    /// Import a whole database image as a new file.
    ///
    /// Without an explicit `block_size` the image header's page-size field
    /// is consulted (big-endian 16-bit at offset 16, where 1 stands for
    /// 65536). The image length must be a whole number of blocks and the
    /// file must not already exist.
    pub async fn import(
        &self,
        path: &str,
        bytes: &[u8],
        block_size: Option<u32>,
    ) -> VfsResult<()> {
        let path = uri::normalize(path)?;
        let block_size = match block_size {
            Some(n) => n,
            None => sniff_block_size(bytes).ok_or(VfsError::Error)?,
        };
        if !valid_block_size(block_size) || bytes.len() % block_size as usize != 0 {
            return Err(VfsError::Error);
        }
        if self.exists(&path).await? {
            return Err(VfsError::CantOpen);
        }

        let mut rows: Vec<Row> = bytes
            .chunks(block_size as usize)
            .enumerate()
            .map(|(index, chunk)| {
                Row::Block(crate::kv::BlockRow {
                    path: path.clone(),
                    offset: index as u64 * block_size as u64,
                    version: -1,
                    data: chunk.to_vec(),
                })
            })
            .collect();
        rows.push(Row::Metadata(MetadataRow {
            path: path.clone(),
            block_size,
            generation: new_generation(),
            file_size: bytes.len() as u64,
            max_version: -1,
        }));

        self.submit(|done| Job::Apply { rows, done }).await
    }

    /// Export a file as one contiguous image of its committed state.
    pub async fn export(&self, path: &str) -> VfsResult<Vec<u8>> {
        let path = uri::normalize(path)?;
        let mut co = Coalescer::new(self.db.clone(), Durability::Relaxed);
        let meta = store::load_metadata(&mut co, &path)
            .map_err(|_| VfsError::Io)?
            .ok_or(VfsError::CantOpen)?;

        let mut image = vec![0u8; meta.file_size as usize];
        let mut offset = 0u64;
        while offset < meta.file_size {
            if let Some(data) =
                store::resolve_block(&mut co, None, &path, offset, meta.max_version)
                    .map_err(|_| VfsError::Io)?
            {
                let start = offset as usize;
                let end = (start + data.len()).min(image.len());
                image[start..end].copy_from_slice(&data[..end - start]);
            }
            offset += meta.block_size as u64;
        }
        Ok(image)
    }

    /// Delete every row of `path`.
    pub async fn delete(&self, path: &str) -> VfsResult<()> {
        let path = uri::normalize(path)?;
        self.submit(|done| Job::Delete { path, done }).await
    }

    /// Delete every file in the database.
    pub async fn clear(&self) -> VfsResult<()> {
        self.submit(|done| Job::Clear { done }).await
    }

    async fn submit(
        &self,
        job: impl FnOnce(oneshot::Sender<Result<(), KvError>>) -> Job,
    ) -> VfsResult<()> {
        let (done, wait) = oneshot::channel();
        if self.jobs.send(job(done)).await.is_err() {
            return Err(VfsError::Error);
        }
        match wait.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(VfsError::Io),
            Err(_) => Err(VfsError::Error),
        }
    }
}

async fn run(db: Database, rx: async_channel::Receiver<Job>) {
    while let Ok(job) = rx.recv().await {
        match job {
            Job::Apply { rows, done } => {
                let _ = done.send(apply(&db, rows).await);
            }
            Job::Delete { path, done } => {
                let _ = done.send(delete(&db, &path).await);
            }
            Job::Clear { done } => {
                let _ = done.send(clear(&db).await);
            }
        }
    }
}

async fn apply(db: &Database, rows: Vec<Row>) -> Result<(), KvError> {
    let mut tx = db.begin(TxMode::ReadWrite, Durability::Strict);
    for row in rows {
        tx.put(row)?;
    }
    tx.commit().await
}

async fn delete(db: &Database, path: &str) -> Result<(), KvError> {
    let mut tx = db.begin(TxMode::ReadWrite, Durability::Strict);
    tx.delete_range(Key::rows_of(path))?;
    tx.commit().await
}

async fn clear(db: &Database) -> Result<(), KvError> {
    use std::ops::Bound;
    let mut tx = db.begin(TxMode::ReadWrite, Durability::Strict);
    tx.delete_range((Bound::Unbounded, Bound::Unbounded))?;
    tx.commit().await
}

/// Read the page-size field of a database image header.
fn sniff_block_size(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 18 {
        return None;
    }
    match BigEndian::read_u16(&bytes[16..18]) {
        1 => Some(65536),
        n => Some(u32::from(n)),
    }
}
