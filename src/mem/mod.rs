//! In-memory VFS, the reference back-end.
//!
//! Each file is a resizable byte buffer plus its logical size. Nothing here
//! ever suspends: buffers live behind plain mutexes and lock operations
//! only track the level for the engine's benefit. Instances are not shared
//! across contexts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::locks::LockLevel;
use crate::vfs::flags::{AccessCheck, ControlOp, DeviceCaps, OpenFlags, SyncFlags};
use crate::vfs::{path as uri, ErrorSlot, FileId, ReadOutcome, Vfs, VfsError, VfsResult};

const SECTOR_SIZE: u32 = 512;

/// Buffers double until this size, then grow by an eighth at a time.
const GROWTH_KNEE: usize = 1 << 20;

struct MemFile {
    data: Vec<u8>,
    size: usize,
}

impl MemFile {
    fn new() -> MemFile {
        MemFile { data: Vec::new(), size: 0 }
    }

    /// Grow the backing buffer to hold at least `needed` bytes.
    fn reserve(&mut self, needed: usize) {
        if self.data.len() >= needed {
            return;
        }
        let mut capacity = self.data.len().max(64);
        while capacity < needed {
            capacity = if capacity < GROWTH_KNEE { capacity * 2 } else { capacity + capacity / 8 };
        }
        self.data.resize(capacity, 0);
    }

    fn write_at(&mut self, data: &[u8], offset: usize) {
        self.reserve(offset + data.len());
        self.data[offset..offset + data.len()].copy_from_slice(data);
        self.size = self.size.max(offset + data.len());
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> ReadOutcome {
        buf.fill(0);
        if offset < self.size {
            let n = (self.size - offset).min(buf.len());
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        }
        if offset + buf.len() > self.size {
            ReadOutcome::Short
        } else {
            ReadOutcome::Full
        }
    }

    fn truncate(&mut self, size: usize) {
        self.size = size;
        if size < self.data.len() {
            self.data[size..].fill(0);
        }
    }
}

struct MemDescriptor {
    path: String,
    flags: OpenFlags,
    file: Arc<Mutex<MemFile>>,
    level: Mutex<LockLevel>,
}

/// The in-memory VFS. Single-context by design.
#[derive(Default)]
pub struct MemVfs {
    files: Mutex<HashMap<String, Arc<Mutex<MemFile>>>>,
    table: Mutex<HashMap<u64, Arc<MemDescriptor>>>,
    next_id: AtomicU64,
    errors: ErrorSlot,
}

impl MemVfs {
    pub fn new() -> MemVfs {
        MemVfs::default()
    }

    fn descriptor(&self, id: FileId) -> VfsResult<Arc<MemDescriptor>> {
        self.table
            .lock()
            .expect("descriptor table poisoned")
            .get(&id.0)
            .cloned()
            .ok_or_else(|| self.errors.record(VfsError::Error, format!("unknown handle {}", id.0)))
    }
}

#[async_trait]
impl Vfs for MemVfs {
    async fn open(&self, path: Option<&str>, fl: OpenFlags) -> VfsResult<(FileId, OpenFlags)> {
        let path = match path {
            Some(p) => uri::normalize(p)?,
            None => uri::anonymous(),
        };
        let file = {
            let mut files = self.files.lock().expect("file table poisoned");
            match files.get(&path) {
                Some(file) => {
                    if fl.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                        return Err(self
                            .errors
                            .record(VfsError::CantOpen, format!("{path} already exists")));
                    }
                    Arc::clone(file)
                }
                None => {
                    if !fl.contains(OpenFlags::CREATE) {
                        return Err(self
                            .errors
                            .record(VfsError::CantOpen, format!("{path} does not exist")));
                    }
                    let file = Arc::new(Mutex::new(MemFile::new()));
                    files.insert(path.clone(), Arc::clone(&file));
                    file
                }
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let descriptor = MemDescriptor {
            path,
            flags: fl,
            file,
            level: Mutex::new(LockLevel::None),
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
            self.files.lock().expect("file table poisoned").remove(&d.path);
        }
        Ok(())
    }

    async fn read(&self, id: FileId, buf: &mut [u8], offset: u64) -> VfsResult<ReadOutcome> {
        let d = self.descriptor(id)?;
        let file = d.file.lock().expect("file poisoned");
        Ok(file.read_at(buf, offset as usize))
    }

    async fn write(&self, id: FileId, data: &[u8], offset: u64) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        if !d.flags.writable() {
            return Err(self
                .errors
                .record(VfsError::IoWrite, format!("{} opened read-only", d.path)));
        }
        let mut file = d.file.lock().expect("file poisoned");
        file.write_at(data, offset as usize);
        Ok(())
    }

    async fn truncate(&self, id: FileId, size: u64) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut file = d.file.lock().expect("file poisoned");
        file.truncate(size as usize);
        Ok(())
    }

    async fn sync(&self, _id: FileId, _flags: SyncFlags) -> VfsResult<()> {
        Ok(())
    }

    async fn file_size(&self, id: FileId) -> VfsResult<u64> {
        let d = self.descriptor(id)?;
        let file = d.file.lock().expect("file poisoned");
        Ok(file.size as u64)
    }

    async fn lock(&self, id: FileId, level: LockLevel) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut held = d.level.lock().expect("lock level poisoned");
        if level > *held {
            *held = level;
        }
        Ok(())
    }

    async fn unlock(&self, id: FileId, level: LockLevel) -> VfsResult<()> {
        let d = self.descriptor(id)?;
        let mut held = d.level.lock().expect("lock level poisoned");
        if level < *held {
            *held = level;
        }
        Ok(())
    }

    async fn check_reserved_lock(&self, id: FileId) -> VfsResult<bool> {
        let d = self.descriptor(id)?;
        let held = *d.level.lock().expect("lock level poisoned") >= LockLevel::Reserved;
        Ok(held)
    }

    async fn file_control(&self, _id: FileId, _op: ControlOp) -> VfsResult<()> {
        Err(VfsError::NotFound)
    }

    fn sector_size(&self, _id: FileId) -> u32 {
        SECTOR_SIZE
    }

    fn device_characteristics(&self, _id: FileId) -> DeviceCaps {
        DeviceCaps::ATOMIC | DeviceCaps::SAFE_APPEND | DeviceCaps::SEQUENTIAL
    }

    async fn access(&self, path: &str, _check: AccessCheck) -> VfsResult<bool> {
        let path = uri::normalize(path)?;
        Ok(self.files.lock().expect("file table poisoned").contains_key(&path))
    }

    async fn delete(&self, path: &str, _sync_dir: bool) -> VfsResult<()> {
        let path = uri::normalize(path)?;
        self.files.lock().expect("file table poisoned").remove(&path);
        Ok(())
    }

    fn full_pathname(&self, path: &str) -> VfsResult<String> {
        uri::normalize(path)
    }

    fn last_error(&self, buf: &mut [u8]) -> Option<(VfsError, usize)> {
        self.errors.fetch(buf)
    }
}
