//! Access-handle pool VFS.
//!
//! A fixed pool of pre-created files is opened when the pool starts; each
//! file's trailing metadata region records the pathname assigned to it, so
//! a restart rebuilds the name directory by reading the regions back.
//! `open` claims an unassigned handle and records the association; closing
//! a delete-on-close file clears it and returns the handle to the pool.
//! I/O dispatches synchronously on the claimed handle; the lock protocol
//! still runs through the shared manager, because several contexts may work
//! against the same paths even though each pool directory has one owner.

mod handle;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use tokio::sync::Mutex;

use crate::locks::advisory::{AcquireOptions, LockMode, LockRegistry, LockToken};
use crate::locks::{LockLevel, LockManager, LockOptions};
use crate::vfs::flags::{AccessCheck, ControlOp, DeviceCaps, OpenFlags, SyncFlags};
use crate::vfs::{path as uri, ErrorSlot, FileId, ReadOutcome, Vfs, VfsError, VfsResult};

use handle::{AccessHandle, Assignment};
pub use handle::{MAX_ASSIGNED_PATH, REGION_SIZE};

/// Most handles a pool may ever grow to.
pub const MAX_CAPACITY: usize = 1024;

const SECTOR_SIZE: u32 = 4096;

/// Tunables for the pool VFS.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Handles pre-created at startup.
    pub capacity: usize,
    /// Lock acquisition tunables.
    pub lock: LockOptions,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions { capacity: 6, lock: LockOptions::default() }
    }
}

struct Slot {
    physical: PathBuf,
    handle: AccessHandle,
}

struct PoolDescriptor {
    path: String,
    flags: OpenFlags,
    slot: usize,
    state: Mutex<PoolFileState>,
}

struct PoolFileState {
    manager: LockManager,
}

/// The pool VFS. One instance owns one pool directory; the advisory
/// registry refuses a second owner of the same directory.
pub struct PoolVfs {
    dir: PathBuf,
    registry: LockRegistry,
    opts: PoolOptions,
    slots: StdMutex<Vec<Option<Arc<Slot>>>>,
    by_name: StdMutex<HashMap<String, usize>>,
    busy: StdMutex<HashSet<usize>>,
    free: ArrayQueue<usize>,
    next_suffix: AtomicU64,
    table: StdMutex<HashMap<u64, Arc<PoolDescriptor>>>,
    next_id: AtomicU64,
    errors: ErrorSlot,
    _owner: LockToken,
}

impl PoolVfs {
    /// Open the pool rooted at `dir`, creating handles up to
    /// `opts.capacity` and rebuilding the name directory from the trailing
    /// regions. Fails when another live context already owns the directory.
    pub async fn open_pool(
        dir: impl AsRef<Path>,
        registry: LockRegistry,
        opts: PoolOptions,
    ) -> io::Result<PoolVfs> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let owner_name = format!("{}#pool", dir.display());
        let owner = registry
            .acquire(&owner_name, LockMode::Exclusive, AcquireOptions {
                if_available: true,
                timeout: None,
            })
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::AddrInUse, "pool directory already in use")
            })?;

        let mut slots: Vec<Option<Arc<Slot>>> = Vec::new();
        let mut by_name = HashMap::new();
        let free = ArrayQueue::new(MAX_CAPACITY);
        let mut max_suffix = 0u64;

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("ah-"))
            })
            .collect();
        entries.sort();

        for physical in entries {
            if let Some(suffix) = physical
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| u64::from_str_radix(name.trim_start_matches("ah-"), 16).ok())
            {
                max_suffix = max_suffix.max(suffix);
            }
            let handle = AccessHandle::open(&physical)?;
            let index = slots.len();
            match handle.assignment()? {
                Some(assignment) => {
                    by_name.insert(assignment.path, index);
                }
                None => {
                    // unassigned or torn region: reclaim the handle
                    handle.reset()?;
                    let _ = free.push(index);
                }
            }
            slots.push(Some(Arc::new(Slot { physical, handle })));
        }

        let pool = PoolVfs {
            dir,
            registry,
            opts,
            slots: StdMutex::new(slots),
            by_name: StdMutex::new(by_name),
            busy: StdMutex::new(HashSet::new()),
            free,
            next_suffix: AtomicU64::new(max_suffix + 1),
            table: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            errors: ErrorSlot::default(),
            _owner: owner,
        };
        let missing = pool.opts.capacity.saturating_sub(pool.capacity());
        pool.grow(missing)?;
        Ok(pool)
    }

    /// Handles currently backing a file.
    pub fn used(&self) -> usize {
        self.by_name.lock().expect("pool state poisoned").len()
    }

    /// Handles in the pool, assigned or not.
    pub fn capacity(&self) -> usize {
        self.slots.lock().expect("pool state poisoned").iter().flatten().count()
    }

    /// Create `n` additional handles.
    pub fn add_capacity(&self, n: usize) -> io::Result<usize> {
        self.grow(n)
    }

    /// Remove up to `n` unassigned handles. Returns how many went away.
    pub fn reduce_capacity(&self, n: usize) -> io::Result<usize> {
        let mut removed = 0;
        for _ in 0..n {
            let Some(index) = self.free.pop() else { break };
            let slot = {
                let mut slots = self.slots.lock().expect("pool state poisoned");
                slots[index].take()
            };
            if let Some(slot) = slot {
                std::fs::remove_file(&slot.physical)?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    fn grow(&self, n: usize) -> io::Result<usize> {
        let mut created = 0;
        for _ in 0..n {
            if self.capacity() >= MAX_CAPACITY {
                break;
            }
            let suffix = self.next_suffix.fetch_add(1, Ordering::Relaxed);
            let physical = self.dir.join(format!("ah-{suffix:08x}"));
            let handle = AccessHandle::open(&physical)?;
            handle.reset()?;
            let mut slots = self.slots.lock().expect("pool state poisoned");
            let index = slots.len();
            slots.push(Some(Arc::new(Slot { physical, handle })));
            drop(slots);
            let _ = self.free.push(index);
            created += 1;
        }
        Ok(created)
    }

    fn slot(&self, index: usize) -> VfsResult<Arc<Slot>> {
        self.slots
            .lock()
            .expect("pool state poisoned")
            .get(index)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| self.errors.record(VfsError::Error, format!("stale slot {index}")))
    }

    fn descriptor(&self, id: FileId) -> VfsResult<Arc<PoolDescriptor>> {
        self.table
            .lock()
            .expect("descriptor table poisoned")
            .get(&id.0)
            .cloned()
            .ok_or_else(|| self.errors.record(VfsError::Error, format!("unknown handle {}", id.0)))
    }

    fn io_err(&self, code: VfsError, what: &str, path: &str, err: io::Error) -> VfsError {
        self.errors.record(code, format!("{what} {path}: {err}"))
    }
}

#[async_trait]
impl Vfs for PoolVfs {
    async fn open(&self, path: Option<&str>, fl: OpenFlags) -> VfsResult<(FileId, OpenFlags)> {
        let path = match path {
            Some(p) => uri::normalize(p)?,
            None => uri::anonymous(),
        };
        if path.len() > MAX_ASSIGNED_PATH {
            return Err(self.errors.record(VfsError::CantOpen, format!("{path} is too long")));
        }

        let existing = self.by_name.lock().expect("pool state poisoned").get(&path).copied();
        let slot_index = match existing {
            Some(index) => {
                if fl.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(self
                        .errors
                        .record(VfsError::CantOpen, format!("{path} already exists")));
                }
                index
            }
            None => {
                if !fl.contains(OpenFlags::CREATE) {
                    return Err(self
                        .errors
                        .record(VfsError::CantOpen, format!("{path} does not exist")));
                }
                let Some(index) = self.free.pop() else {
                    return Err(self.errors.record(
                        VfsError::CantOpen,
                        format!("pool exhausted opening {path}"),
                    ));
                };
                let slot = self.slot(index)?;
                slot.handle
                    .assign(Some(&Assignment { path: path.clone(), flags: fl.bits() }))
                    .map_err(|err| self.io_err(VfsError::CantOpen, "assign", &path, err))?;
                self.by_name.lock().expect("pool state poisoned").insert(path.clone(), index);
                index
            }
        };

        {
            let mut busy = self.busy.lock().expect("pool state poisoned");
            if !busy.insert(slot_index) {
                return Err(self
                    .errors
                    .record(VfsError::CantOpen, format!("{path} is already open")));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let manager = LockManager::new(self.registry.clone(), path.clone(), self.opts.lock);
        let descriptor = PoolDescriptor {
            path,
            flags: fl,
            slot: slot_index,
            state: Mutex::new(PoolFileState { manager }),
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

        if d.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            let slot = self.slot(d.slot)?;
            slot.handle
                .reset()
                .map_err(|err| self.io_err(VfsError::IoClose, "close", &d.path, err))?;
            self.by_name.lock().expect("pool state poisoned").remove(&d.path);
            self.busy.lock().expect("pool state poisoned").remove(&d.slot);
            let _ = self.free.push(d.slot);
        } else {
            self.busy.lock().expect("pool state poisoned").remove(&d.slot);
        }

        let mut state = d.state.lock().await;
        state.manager.unlock(LockLevel::None).await.ok();
        Ok(())
    }

    async fn read(&self, id: FileId, buf: &mut [u8], offset: u64) -> VfsResult<ReadOutcome> {
        let d = self.descriptor(id)?;
        let slot = self.slot(d.slot)?;
        let n = slot
            .handle
            .read_at(buf, offset)
            .map_err(|err| self.io_err(VfsError::IoRead, "read", &d.path, err))?;
        if n < buf.len() {
            buf[n..].fill(0);
            Ok(ReadOutcome::Short)
        } else {
            Ok(ReadOutcome::Full)
        }
    }

    async fn write(&self, id: FileId, data: &[u8], offset: u64) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        if !d.flags.writable() {
            return Err(self
                .errors
                .record(VfsError::IoWrite, format!("{} opened read-only", d.path)));
        }
        let slot = self.slot(d.slot)?;
        slot.handle
            .write_at(data, offset)
            .map_err(|err| self.io_err(VfsError::IoWrite, "write", &d.path, err))
    }

    async fn truncate(&self, id: FileId, size: u64) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let slot = self.slot(d.slot)?;
        slot.handle
            .truncate(size)
            .map_err(|err| self.io_err(VfsError::IoTruncate, "truncate", &d.path, err))
    }

    async fn sync(&self, id: FileId, flags: SyncFlags) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let slot = self.slot(d.slot)?;
        slot.handle
            .flush(flags.data_only)
            .map_err(|err| self.io_err(VfsError::IoFsync, "sync", &d.path, err))
    }

    async fn file_size(&self, id: FileId) -> VfsResult<u64> {
        let d = self.descriptor(id)?;
        let slot = self.slot(d.slot)?;
        slot.handle
            .size()
            .map_err(|err| self.io_err(VfsError::IoFstat, "file_size", &d.path, err))
    }

    async fn lock(&self, id: FileId, level: LockLevel) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut state = d.state.lock().await;
        state.manager.lock(level).await
    }

    async fn unlock(&self, id: FileId, level: LockLevel) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut state = d.state.lock().await;
        state.manager.unlock(level).await
    }

    async fn check_reserved_lock(&self, id: FileId) -> VfsResult<bool> {
        let d = self.descriptor(id)?;
        let state = d.state.lock().await;
        Ok(state.manager.check_reserved())
    }

    async fn file_control(&self, _id: FileId, _op: ControlOp) -> VfsResult<()> {
        Err(VfsError::NotFound)
    }

    fn sector_size(&self, _id: FileId) -> u32 {
        SECTOR_SIZE
    }

    fn device_characteristics(&self, _id: FileId) -> DeviceCaps {
        DeviceCaps::UNDELETABLE_WHEN_OPEN
    }

    async fn access(&self, path: &str, _check: AccessCheck) -> VfsResult<bool> {
        let path = uri::normalize(path)?;
        Ok(self.by_name.lock().expect("pool state poisoned").contains_key(&path))
    }

    async fn delete(&self, path: &str, sync_dir: bool) -> VfsResult<()> {
        let path = uri::normalize(path)?;
        let index = {
            let by_name = self.by_name.lock().expect("pool state poisoned");
            by_name.get(&path).copied()
        };
        let Some(index) = index else { return Ok(()) };
        if self.busy.lock().expect("pool state poisoned").contains(&index) {
            return Err(self
                .errors
                .record(VfsError::IoDelete, format!("{path} is open")));
        }
        let slot = self.slot(index)?;
        slot.handle
            .reset()
            .map_err(|err| self.io_err(VfsError::IoDelete, "delete", &path, err))?;
        if sync_dir {
            slot.handle
                .flush(false)
                .map_err(|err| self.io_err(VfsError::IoDelete, "delete", &path, err))?;
        }
        self.by_name.lock().expect("pool state poisoned").remove(&path);
        let _ = self.free.push(index);
        Ok(())
    }

    fn full_pathname(&self, path: &str) -> VfsResult<String> {
        uri::normalize(path)
    }

    fn last_error(&self, buf: &mut [u8]) -> Option<(VfsError, usize)> {
        self.errors.fetch(buf)
    }
}
