//! Virtual file system contract consumed by the embedded relational engine.
//!
//! Every back-end exposes the same operation set through [`Vfs`]; the engine
//! sees no difference between them. All types are expressed with idiomatic
//! Rust naming; errors are a plain status enum whose discriminants are the
//! engine's numeric code space.

pub mod flags;
pub mod path;

use std::sync::Mutex;

use async_trait::async_trait;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;

use crate::locks::LockLevel;
use flags::{AccessCheck, ControlOp, DeviceCaps, OpenFlags, SyncFlags};

/// Convenient result alias used by all VFS operations.
pub type VfsResult<T> = Result<T, VfsError>;

/// Handle identifying one open file within a VFS instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

/// Outcome of a read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Every requested byte came from file content.
    Full,
    /// The file ended before the requested range did; the tail of the buffer
    /// was zero-filled and the engine receives the short-read status
    /// alongside the data.
    Short,
}

impl ReadOutcome {
    /// Numeric status the engine receives for this outcome.
    pub fn code(self) -> u32 {
        match self {
            ReadOutcome::Full => 0,
            ReadOutcome::Short => VfsError::IoShortRead.code(),
        }
    }
}

/// Engine status codes surfaced by VFS operations.
///
/// Discriminants are the engine's standard code space, so a status crosses
/// the boundary as a plain integer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum VfsError {
    /// Generic failure. Also the report for lock-state-machine violations,
    /// which are programmer errors and never retried.
    Error = 1,
    /// Another context holds a conflicting lock; the engine retries.
    Busy = 5,
    /// Substrate failure not otherwise classified.
    Io = 10,
    /// Unknown `file_control` operation.
    NotFound = 12,
    /// The file does not exist and create was not requested, or the handle
    /// pool is exhausted.
    CantOpen = 14,
    /// Substrate failure while reading.
    IoRead = 266,
    /// Read past end of file; the unread tail was zero-filled.
    IoShortRead = 522,
    /// Substrate failure while writing.
    IoWrite = 778,
    /// Substrate failure while flushing to durable storage.
    IoFsync = 1034,
    /// Substrate failure while truncating.
    IoTruncate = 1546,
    /// Substrate failure while reading a file's size.
    IoFstat = 1802,
    /// Substrate failure while releasing a lock.
    IoUnlock = 2058,
    /// Substrate failure while taking a read lock.
    IoRdlock = 2314,
    /// Substrate failure while deleting a file.
    IoDelete = 2570,
    /// Substrate failure while probing for a file's existence.
    IoAccess = 3338,
    /// Substrate failure while answering a reserved-lock probe.
    IoCheckReservedLock = 3594,
    /// Substrate failure while taking a write lock.
    IoLock = 3850,
    /// Substrate failure while closing a file.
    IoClose = 4106,
}

impl VfsError {
    /// Numeric code handed to the engine.
    pub fn code(self) -> u32 {
        self.to_u32().unwrap_or(1)
    }
}

/// Most recent error surfaced by a VFS instance.
///
/// The engine retrieves it for diagnostic reporting; the message is
/// truncated to whatever buffer the caller supplies.
#[derive(Debug, Default)]
pub struct ErrorSlot(Mutex<Option<(VfsError, String)>>);

impl ErrorSlot {
    /// Record `err` with a diagnostic message and hand `err` back so call
    /// sites can return it in one expression.
    pub fn record(&self, err: VfsError, message: impl Into<String>) -> VfsError {
        let message = message.into();
        tracing::debug!(code = err.code(), %message, "vfs error");
        *self.0.lock().expect("error slot poisoned") = Some((err, message));
        err
    }

    /// Copy the last message into `buf`, truncated to its length. Returns the
    /// recorded code and how many bytes were written.
    pub fn fetch(&self, buf: &mut [u8]) -> Option<(VfsError, usize)> {
        let slot = self.0.lock().expect("error slot poisoned");
        let (err, message) = slot.as_ref()?;
        let n = message.len().min(buf.len());
        buf[..n].copy_from_slice(&message.as_bytes()[..n]);
        Some((*err, n))
    }
}

/// Operation set the engine invokes against a virtual file system.
///
/// Operations on one [`FileId`] are issued serially by the engine and every
/// back-end preserves that order. Any operation except [`Vfs::sector_size`],
/// [`Vfs::device_characteristics`] and [`Vfs::full_pathname`] may suspend.
#[async_trait]
pub trait Vfs: Send + Sync {
    /// Open `path`, or an anonymous file when `path` is `None`. Returns the
    /// new handle together with the flags actually honoured; flags the
    /// back-end does not act on are echoed back unchanged.
    async fn open(&self, path: Option<&str>, fl: OpenFlags) -> VfsResult<(FileId, OpenFlags)>;

    /// Close a handle, flushing any pending batched state. A file opened
    /// with [`OpenFlags::DELETE_ON_CLOSE`] is removed atomically with the
    /// close.
    async fn close(&self, id: FileId) -> VfsResult<()>;

    /// Fill `buf` with file bytes starting at `offset`, zero-filling past
    /// the end of the file.
    async fn read(&self, id: FileId, buf: &mut [u8], offset: u64) -> VfsResult<ReadOutcome>;

    /// Persist `data` at `offset`, extending the file if necessary.
    async fn write(&self, id: FileId, data: &[u8], offset: u64) -> VfsResult<()>;

    /// Make the file exactly `size` bytes long.
    async fn truncate(&self, id: FileId, size: u64) -> VfsResult<()>;

    /// Flush all pending state and return once the substrate has
    /// acknowledged durability at least as strong as `flags` implies.
    async fn sync(&self, id: FileId, flags: SyncFlags) -> VfsResult<()>;

    /// Current logical size in bytes, reflecting pending writes and
    /// truncations.
    async fn file_size(&self, id: FileId) -> VfsResult<u64>;

    /// Move the handle's lock up to `level`.
    async fn lock(&self, id: FileId, level: LockLevel) -> VfsResult<()>;

    /// Move the handle's lock down to `level`.
    async fn unlock(&self, id: FileId, level: LockLevel) -> VfsResult<()>;

    /// Whether some context (possibly this one) holds `Reserved` or higher
    /// on the file's path.
    async fn check_reserved_lock(&self, id: FileId) -> VfsResult<bool>;

    /// Back-end-specific control operation; unknown ops return
    /// [`VfsError::NotFound`].
    async fn file_control(&self, id: FileId, op: ControlOp) -> VfsResult<()>;

    /// Sector size of the file, a power of two between 512 and 65536.
    fn sector_size(&self, id: FileId) -> u32;

    /// Capability bits of the device backing the file.
    fn device_characteristics(&self, id: FileId) -> DeviceCaps;

    /// Whether `path` exists (or is readable/writable, per `check`).
    async fn access(&self, path: &str, check: AccessCheck) -> VfsResult<bool>;

    /// Remove `path`. With `sync_dir` the removal itself is made durable
    /// before returning.
    async fn delete(&self, path: &str, sync_dir: bool) -> VfsResult<()>;

    /// Canonical form of `path`: its input unchanged after normalisation.
    fn full_pathname(&self, path: &str) -> VfsResult<String>;

    /// Retrieve the last recorded error message, truncated to `buf`.
    fn last_error(&self, buf: &mut [u8]) -> Option<(VfsError, usize)>;
}
