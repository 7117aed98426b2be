//! Batch-atomic VFS over the transactional key/value substrate.
//!
//! Byte ranges map to fixed-size versioned blocks (default 4096 bytes).
//! A reader entering `Shared` captures the metadata row's `max_version` as
//! its snapshot and every read in that lock interval resolves against it. A
//! writer at `Reserved` or above stages writes into a batch stamped
//! `max_version - 1`; `sync` commits the batch blocks and the updated
//! metadata row in one substrate transaction, so peers observe either the
//! whole batch or none of it. A context that dies mid-batch leaves the
//! pre-batch state behind.

mod coalesce;
mod store;
pub mod util;

#[cfg(test)]
mod tests;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use moka::sync::Cache;
use tokio::sync::Mutex;

use crate::kv::{Database, Durability, Key, KvError, MetadataRow, PurgeRow, Row};
use crate::locks::advisory::LockRegistry;
use crate::locks::{LockLevel, LockManager, LockOptions};
use crate::vfs::flags::{AccessCheck, ControlOp, DeviceCaps, OpenFlags, SyncFlags};
use crate::vfs::{path as uri, ErrorSlot, FileId, ReadOutcome, Vfs, VfsError, VfsResult};

use coalesce::Coalescer;
use store::BlockCache;
pub use util::BlockStoreAdmin;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest accepted block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;

fn valid_block_size(n: u32) -> bool {
    n.is_power_of_two() && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&n)
}

fn new_generation() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

/// Tunables for the block-store VFS.
#[derive(Debug, Clone)]
pub struct BlockVfsOptions {
    /// Block size for newly created files.
    pub block_size: u32,
    /// Durability requested from the substrate at commit.
    pub durability: Durability,
    /// Advertise batch-atomic writes to the engine.
    pub batch_writes: bool,
    /// Capacity of the per-context block read cache, in blocks.
    pub cache_capacity: u64,
    /// Most rows one purge pass may delete.
    pub purge_limit: usize,
    /// Lock acquisition tunables.
    pub lock: LockOptions,
}

impl Default for BlockVfsOptions {
    fn default() -> Self {
        BlockVfsOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            durability: Durability::Relaxed,
            batch_writes: true,
            cache_capacity: 1024,
            purge_limit: 256,
            lock: LockOptions::default(),
        }
    }
}

/// One write batch: everything staged between reaching `Reserved` and the
/// matching `sync`.
struct Batch {
    version: i64,
    touched: BTreeSet<u64>,
    size: u64,
}

struct FileState {
    manager: LockManager,
    co: Coalescer,
    meta: MetadataRow,
    snapshot: Option<i64>,
    batch: Option<Batch>,
}

struct Descriptor {
    path: String,
    flags: OpenFlags,
    block_size: AtomicU32,
    state: Mutex<FileState>,
}

/// The batch-atomic VFS. One instance per context; instances sharing a
/// [`Database`] and a [`LockRegistry`] share the files behind them.
pub struct BlockVfs {
    db: Database,
    registry: LockRegistry,
    opts: BlockVfsOptions,
    cache: BlockCache,
    table: StdMutex<HashMap<u64, Arc<Descriptor>>>,
    next_id: AtomicU64,
    errors: ErrorSlot,
}

impl BlockVfs {
    pub fn new(db: Database, registry: LockRegistry, opts: BlockVfsOptions) -> BlockVfs {
        BlockVfs {
            cache: Cache::new(opts.cache_capacity),
            db,
            registry,
            opts,
            table: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            errors: ErrorSlot::default(),
        }
    }

    /// Administrative utility over the same database.
    pub fn admin(&self) -> BlockStoreAdmin {
        BlockStoreAdmin::new(self.db.clone())
    }

    fn descriptor(&self, id: FileId) -> VfsResult<Arc<Descriptor>> {
        self.table
            .lock()
            .expect("descriptor table poisoned")
            .get(&id.0)
            .cloned()
            .ok_or_else(|| self.errors.record(VfsError::Error, format!("unknown handle {}", id.0)))
    }

    fn kv_err(&self, code: VfsError, what: &str, path: &str, err: KvError) -> VfsError {
        self.errors.record(code, format!("{what} {path}: {err}"))
    }

    /// Commit the open batch: blocks first, then the purge marker, then the
    /// metadata row whose arrival makes the batch visible; finally wait out
    /// the durability fence and run a bounded purge pass.
    async fn commit_batch(&self, d: &Descriptor, st: &mut FileState) -> Result<(), KvError> {
        let Some(batch) = st.batch.take() else {
            return st.co.fence().await;
        };

        let bs = st.meta.block_size as u64;
        let mut offsets = batch.touched;
        if batch.size < st.meta.file_size {
            // blocks now entirely beyond the end of the file
            let mut off = batch.size.div_ceil(bs) * bs;
            while off < st.meta.file_size {
                offsets.insert(off);
                off += bs;
            }
        }
        if let Some(Row::Purge(prev)) = st.co.get(&Key::purge(&d.path))? {
            offsets.extend(prev.offsets);
        }
        st.co.put(Row::Purge(PurgeRow {
            path: d.path.clone(),
            offsets: offsets.into_iter().collect(),
        }))?;

        let meta = MetadataRow {
            path: d.path.clone(),
            block_size: st.meta.block_size,
            generation: st.meta.generation,
            file_size: batch.size,
            max_version: batch.version,
        };
        st.co.put(Row::Metadata(meta.clone()))?;
        st.co.fence().await?;
        tracing::debug!(path = %d.path, version = meta.max_version, size = meta.file_size,
            "batch committed");
        st.meta = meta;

        if st.snapshot.is_some() {
            // the writer keeps reading its own committed state
            st.snapshot = Some(st.meta.max_version);
            st.manager.publish_snapshot(st.meta.max_version).await;
        }

        match store::purge_pass(&mut st.co, &self.registry, &d.path, &st.meta, self.opts.purge_limit)
        {
            Ok(_) => {
                if let Err(err) = st.co.fence().await {
                    tracing::debug!(path = %d.path, %err, "purge commit failed");
                }
            }
            Err(err) => {
                st.co.discard();
                tracing::debug!(path = %d.path, %err, "purge pass failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Vfs for BlockVfs {
    async fn open(&self, path: Option<&str>, fl: OpenFlags) -> VfsResult<(FileId, OpenFlags)> {
        let path = match path {
            Some(p) => uri::normalize(p)?,
            None => uri::anonymous(),
        };
        let mut co = Coalescer::new(self.db.clone(), self.opts.durability);
        let existing = store::load_metadata(&mut co, &path)
            .map_err(|err| self.kv_err(VfsError::CantOpen, "open", &path, err))?;
        let meta = match existing {
            Some(meta) => {
                if fl.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(self
                        .errors
                        .record(VfsError::CantOpen, format!("{path} already exists")));
                }
                meta
            }
            None => {
                if !fl.contains(OpenFlags::CREATE) {
                    return Err(self
                        .errors
                        .record(VfsError::CantOpen, format!("{path} does not exist")));
                }
                let meta = MetadataRow {
                    path: path.clone(),
                    block_size: self.opts.block_size,
                    generation: new_generation(),
                    file_size: 0,
                    max_version: 0,
                };
                store::put_metadata(&mut co, meta.clone())
                    .map_err(|err| self.kv_err(VfsError::CantOpen, "create", &path, err))?;
                co.fence()
                    .await
                    .map_err(|err| self.kv_err(VfsError::CantOpen, "create", &path, err))?;
                meta
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%path, handle = id, ?fl, "open");
        let manager = LockManager::new(self.registry.clone(), path.clone(), self.opts.lock);
        let descriptor = Descriptor {
            block_size: AtomicU32::new(meta.block_size),
            path,
            flags: fl,
            state: Mutex::new(FileState { manager, co, meta, snapshot: None, batch: None }),
        };
        self.table
            .lock()
            .expect("descriptor table poisoned")
            .insert(id, Arc::new(descriptor));
        Ok((FileId(id), fl))
    }

    async fn close(&self, id: FileId) -> VfsResult<()> {
        let d = self
            .table
            .lock()
            .expect("descriptor table poisoned")
            .remove(&id.0)
            .ok_or_else(|| self.errors.record(VfsError::Error, format!("unknown handle {}", id.0)))?;
        let mut guard = d.state.lock().await;
        let st = &mut *guard;

        if st.batch.is_some() {
            tracing::debug!(path = %d.path, "discarding uncommitted batch at close");
            st.batch = None;
            st.co.discard();
        }
        if d.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            st.co
                .delete_range(Key::rows_of(&d.path))
                .map_err(|err| self.kv_err(VfsError::IoClose, "close", &d.path, err))?;
        }
        st.co
            .fence()
            .await
            .map_err(|err| self.kv_err(VfsError::IoClose, "close", &d.path, err))?;
        st.manager.unlock(LockLevel::None).await.ok();
        Ok(())
    }

    async fn read(&self, id: FileId, buf: &mut [u8], offset: u64) -> VfsResult<ReadOutcome> {
        let d = self.descriptor(id)?;
        let mut guard = d.state.lock().await;
        let st = &mut *guard;

        let (snapshot, cacheable) = match &st.batch {
            // a writer reads through its own batch, which must not be cached
            Some(batch) => (batch.version, false),
            None => (st.snapshot.unwrap_or(st.meta.max_version), true),
        };
        let file_size = st.batch.as_ref().map(|b| b.size).unwrap_or(st.meta.file_size);
        let cache = cacheable.then_some((&self.cache, st.meta.generation));
        store::read_range(
            &mut st.co,
            cache,
            &d.path,
            st.meta.block_size,
            file_size,
            snapshot,
            buf,
            offset,
        )
        .map_err(|err| self.kv_err(VfsError::IoRead, "read", &d.path, err))
    }

    async fn write(&self, id: FileId, data: &[u8], offset: u64) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        if !d.flags.writable() {
            return Err(self
                .errors
                .record(VfsError::IoWrite, format!("{} opened read-only", d.path)));
        }
        let mut guard = d.state.lock().await;
        let st = &mut *guard;

        if st.batch.is_none() {
            st.batch = Some(Batch {
                version: st.meta.max_version - 1,
                touched: BTreeSet::new(),
                size: st.meta.file_size,
            });
        }
        let batch = st.batch.as_mut().expect("batch just ensured");
        store::stage_write(
            &mut st.co,
            &d.path,
            st.meta.block_size,
            batch.version,
            &mut batch.touched,
            data,
            offset,
        )
        .map_err(|err| self.kv_err(VfsError::IoWrite, "write", &d.path, err))?;
        batch.size = batch.size.max(offset + data.len() as u64);
        Ok(())
    }

    async fn truncate(&self, id: FileId, size: u64) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut guard = d.state.lock().await;
        let st = &mut *guard;

        if st.batch.is_none() {
            st.batch = Some(Batch {
                version: st.meta.max_version - 1,
                touched: BTreeSet::new(),
                size: st.meta.file_size,
            });
        }
        st.batch.as_mut().expect("batch just ensured").size = size;
        Ok(())
    }

    async fn sync(&self, id: FileId, _flags: SyncFlags) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut guard = d.state.lock().await;
        let st = &mut *guard;
        self.commit_batch(&d, st)
            .await
            .map_err(|err| self.kv_err(VfsError::IoFsync, "sync", &d.path, err))
    }

    async fn file_size(&self, id: FileId) -> VfsResult<u64> {
        let d = self.descriptor(id)?;
        let guard = d.state.lock().await;
        Ok(guard.batch.as_ref().map(|b| b.size).unwrap_or(guard.meta.file_size))
    }

    async fn lock(&self, id: FileId, level: LockLevel) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut guard = d.state.lock().await;
        let st = &mut *guard;

        let had = st.manager.level();
        st.manager.lock(level).await?;
        let now = st.manager.level();

        // a new Shared hold captures the snapshot for this lock interval;
        // a writer reaching Reserved re-captures it, because peers may have
        // committed while this context held only Shared
        let refresh = (had == LockLevel::None && now >= LockLevel::Shared)
            || (had < LockLevel::Reserved && now >= LockLevel::Reserved);
        if refresh {
            match store::load_metadata(&mut st.co, &d.path) {
                Ok(Some(meta)) => {
                    d.block_size.store(meta.block_size, Ordering::Relaxed);
                    st.meta = meta;
                }
                Ok(None) => {
                    // deleted underneath us; keep serving the stale view
                    tracing::debug!(path = %d.path, "metadata gone while locking");
                }
                Err(err) => {
                    st.manager.unlock(LockLevel::None).await.ok();
                    return Err(self.kv_err(VfsError::IoLock, "lock", &d.path, err));
                }
            }
            st.snapshot = Some(st.meta.max_version);
            st.manager.publish_snapshot(st.meta.max_version).await;
        }
        Ok(())
    }

    async fn unlock(&self, id: FileId, level: LockLevel) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut guard = d.state.lock().await;
        let st = &mut *guard;

        if level <= LockLevel::Shared {
            if st.batch.is_some() {
                // a batch abandoned before sync rolls back wholesale
                tracing::debug!(path = %d.path, "discarding uncommitted batch at unlock");
                st.batch = None;
                st.co.discard();
            } else {
                st.co
                    .fence()
                    .await
                    .map_err(|err| self.kv_err(VfsError::IoUnlock, "unlock", &d.path, err))?;
            }
        }
        if level == LockLevel::None {
            st.snapshot = None;
            st.manager.clear_snapshot();
        }
        st.manager.unlock(level).await
    }

    async fn check_reserved_lock(&self, id: FileId) -> VfsResult<bool> {
        let d = self.descriptor(id)?;
        let guard = d.state.lock().await;
        Ok(guard.manager.check_reserved())
    }

    async fn file_control(&self, id: FileId, op: ControlOp) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut guard = d.state.lock().await;
        let st = &mut *guard;
        match op {
            ControlOp::BeginAtomicWrite => {
                if st.batch.is_none() {
                    st.batch = Some(Batch {
                        version: st.meta.max_version - 1,
                        touched: BTreeSet::new(),
                        size: st.meta.file_size,
                    });
                }
                Ok(())
            }
            ControlOp::CommitAtomicWrite => self
                .commit_batch(&d, st)
                .await
                .map_err(|err| self.kv_err(VfsError::IoWrite, "commit batch", &d.path, err)),
            ControlOp::RollbackAtomicWrite => {
                st.batch = None;
                st.co.discard();
                Ok(())
            }
            ControlOp::BlockSize(n) => {
                if !valid_block_size(n) {
                    return Err(self
                        .errors
                        .record(VfsError::Error, format!("invalid block size {n}")));
                }
                if n == st.meta.block_size {
                    return Ok(());
                }
                if st.meta.file_size != 0 || st.batch.is_some() {
                    return Err(self.errors.record(
                        VfsError::Error,
                        format!("{} is not empty; block size is fixed", d.path),
                    ));
                }
                st.meta.block_size = n;
                d.block_size.store(n, Ordering::Relaxed);
                store::put_metadata(&mut st.co, st.meta.clone())
                    .map_err(|err| self.kv_err(VfsError::Io, "set block size", &d.path, err))?;
                st.co
                    .fence()
                    .await
                    .map_err(|err| self.kv_err(VfsError::Io, "set block size", &d.path, err))
            }
            ControlOp::Raw(_) => Err(VfsError::NotFound),
        }
    }

    fn sector_size(&self, id: FileId) -> u32 {
        self.table
            .lock()
            .expect("descriptor table poisoned")
            .get(&id.0)
            .map(|d| d.block_size.load(Ordering::Relaxed))
            .unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    fn device_characteristics(&self, _id: FileId) -> DeviceCaps {
        let mut caps = DeviceCaps::SAFE_APPEND | DeviceCaps::SEQUENTIAL;
        if self.opts.batch_writes {
            caps |= DeviceCaps::BATCH_ATOMIC;
        }
        caps
    }

    async fn access(&self, path: &str, _check: AccessCheck) -> VfsResult<bool> {
        let path = uri::normalize(path)?;
        let mut co = Coalescer::new(self.db.clone(), self.opts.durability);
        let meta = store::load_metadata(&mut co, &path)
            .map_err(|err| self.kv_err(VfsError::IoAccess, "access", &path, err))?;
        Ok(meta.is_some())
    }

    async fn delete(&self, path: &str, sync_dir: bool) -> VfsResult<()> {
        let path = uri::normalize(path)?;
        let durability = if sync_dir { Durability::Strict } else { self.opts.durability };
        let mut co = Coalescer::new(self.db.clone(), durability);
        co.delete_range(Key::rows_of(&path))
            .map_err(|err| self.kv_err(VfsError::IoDelete, "delete", &path, err))?;
        co.fence()
            .await
            .map_err(|err| self.kv_err(VfsError::IoDelete, "delete", &path, err))
    }

    fn full_pathname(&self, path: &str) -> VfsResult<String> {
        uri::normalize(path)
    }

    fn last_error(&self, buf: &mut [u8]) -> Option<(VfsError, usize)> {
        self.errors.fetch(buf)
    }
}
