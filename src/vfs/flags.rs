//! Bit flags and control operations crossing the engine boundary.

use bitflags::bitflags;

bitflags! {
    /// Flags passed to [`crate::vfs::Vfs::open`].
    ///
    /// The values match the engine's open-flag bit assignments, so a flag
    /// word crosses the boundary unchanged. Bits the core does not act on
    /// are preserved and echoed back in the out-flags.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open for reading only.
        const READ_ONLY       = 0x0000_0001;
        /// Open for reading and writing.
        const READ_WRITE      = 0x0000_0002;
        /// Create the file if it does not exist.
        const CREATE          = 0x0000_0004;
        /// With `CREATE`: fail if the file already exists.
        const EXCLUSIVE       = 0x0000_0010;
        /// Remove the file atomically when the handle is closed.
        const DELETE_ON_CLOSE = 0x0000_0008;
        /// The main database file.
        const MAIN_DB         = 0x0000_0100;
        /// A temporary database.
        const TEMP_DB         = 0x0000_0200;
        /// A transient database.
        const TRANSIENT_DB    = 0x0000_0400;
        /// The main rollback journal.
        const MAIN_JOURNAL    = 0x0000_0800;
        /// A temporary journal.
        const TEMP_JOURNAL    = 0x0000_1000;
        /// A statement sub-journal.
        const SUB_JOURNAL     = 0x0000_2000;
        /// A super-journal used for multi-database commits.
        const SUPER_JOURNAL   = 0x0000_4000;
        /// A write-ahead log.
        const WAL             = 0x0008_0000;

        const _ = !0;
    }
}

impl OpenFlags {
    /// Whether the file may be written through this handle.
    pub fn writable(self) -> bool {
        self.contains(OpenFlags::READ_WRITE)
    }
}

bitflags! {
    /// Device capability bits reported by
    /// [`crate::vfs::Vfs::device_characteristics`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DeviceCaps: u32 {
        /// Writes of any size are atomic.
        const ATOMIC                = 0x0000_0001;
        /// Data is appended before the file size is extended.
        const SAFE_APPEND           = 0x0000_0200;
        /// Writes reach the device in the order they were issued.
        const SEQUENTIAL            = 0x0000_0400;
        /// An open file cannot be deleted out from under the handle.
        const UNDELETABLE_WHEN_OPEN = 0x0000_0800;
        /// A group of writes bracketed by atomic-write control operations
        /// commits as a unit.
        const BATCH_ATOMIC          = 0x0000_4000;
    }
}

/// Durability requested by [`crate::vfs::Vfs::sync`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyncFlags {
    /// Flush through every caching layer, not just to the device.
    pub full: bool,
    /// Only file content needs to reach storage, not its metadata.
    pub data_only: bool,
}

impl SyncFlags {
    /// The common flush level.
    pub const NORMAL: SyncFlags = SyncFlags { full: false, data_only: false };
    /// Flush through every layer.
    pub const FULL: SyncFlags = SyncFlags { full: true, data_only: false };
}

/// What [`crate::vfs::Vfs::access`] should probe for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessCheck {
    /// Does the file exist at all.
    Exists,
    /// Can it be read and written.
    ReadWrite,
    /// Can it be read.
    Read,
}

/// Typed `file_control` operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlOp {
    /// Start collecting writes into one atomic batch.
    BeginAtomicWrite,
    /// Commit the collected batch.
    CommitAtomicWrite,
    /// Discard the collected batch.
    RollbackAtomicWrite,
    /// Override the file's block size. Accepted only while the file is
    /// empty; an established file keeps its block size until a full
    /// rewrite.
    BlockSize(u32),
    /// Any engine opcode the back-end does not recognise.
    Raw(u32),
}
