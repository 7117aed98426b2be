//! Synchronous access handles over the host filesystem.
//!
//! Every pool file carries a trailing metadata region after its logical
//! content: the pathname assigned to the handle, the persisted open flags
//! and a checksum. The region travels with the end of the file as it grows
//! and shrinks, and a region that fails its checksum marks the handle as
//! unassigned, so a torn write at worst returns a handle to the pool.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

/// Longest pathname the region can record.
pub const MAX_ASSIGNED_PATH: usize = 512;

const OFFSET_PATH: usize = 2;
const OFFSET_FLAGS: usize = OFFSET_PATH + MAX_ASSIGNED_PATH;
const OFFSET_CHECKSUM: usize = OFFSET_FLAGS + 4;

/// Bytes of the trailing region: path length, path, flags, checksum.
pub const REGION_SIZE: u64 = (OFFSET_CHECKSUM + 8) as u64;

/// Assignment recorded in a handle's trailing region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub path: String,
    pub flags: u32,
}

/// One pre-created file of the pool, with positioned synchronous I/O.
pub struct AccessHandle {
    file: std::fs::File,
}

impl AccessHandle {
    /// Open or create the physical file, initialising an empty region on
    /// first creation.
    pub fn open(physical: &Path) -> io::Result<AccessHandle> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(physical)?;
        let handle = AccessHandle { file };
        if handle.file.metadata()?.len() < REGION_SIZE {
            handle.file.set_len(REGION_SIZE)?;
            handle.write_region(0, &encode(None))?;
        }
        Ok(handle)
    }

    /// Logical content size, excluding the trailing region.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len().saturating_sub(REGION_SIZE))
    }

    /// Read up to `buf.len()` bytes at `offset`, clamped to the logical
    /// size. Returns how many bytes were read.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let logical = self.size()?;
        if offset >= logical || buf.is_empty() {
            return Ok(0);
        }
        let n = ((logical - offset) as usize).min(buf.len());
        self.file.read_exact_at(&mut buf[..n], offset)?;
        Ok(n)
    }

    /// Write `data` at `offset`, growing the file (and relocating the
    /// region) when the write reaches past the current end.
    pub fn write_at(&self, data: &[u8], offset: u64) -> io::Result<()> {
        let logical = self.size()?;
        let end = offset + data.len() as u64;
        if end > logical {
            let region = self.read_region(logical)?;
            self.file.set_len(end + REGION_SIZE)?;
            self.file.write_all_at(&region, end)?;
        }
        self.file.write_all_at(data, offset)
    }

    /// Make the logical content exactly `size` bytes.
    pub fn truncate(&self, size: u64) -> io::Result<()> {
        let logical = self.size()?;
        if size == logical {
            return Ok(());
        }
        let region = self.read_region(logical)?;
        if size > logical {
            self.file.set_len(size + REGION_SIZE)?;
            self.file.write_all_at(&region, size)?;
        } else {
            // region first, so a crash between the two leaves it intact
            self.file.write_all_at(&region, size)?;
            self.file.set_len(size + REGION_SIZE)?;
        }
        Ok(())
    }

    /// Flush content (and metadata unless `data_only`) to the device.
    pub fn flush(&self, data_only: bool) -> io::Result<()> {
        if data_only {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        }
    }

    /// The assignment recorded in the region, or `None` for an unassigned
    /// or corrupt region.
    pub fn assignment(&self) -> io::Result<Option<Assignment>> {
        let raw = self.read_region(self.size()?)?;
        Ok(decode(&raw))
    }

    /// Record (or clear) the assignment and flush it.
    pub fn assign(&self, assignment: Option<&Assignment>) -> io::Result<()> {
        self.write_region(self.size()?, &encode(assignment))?;
        self.flush(false)
    }

    /// Drop all content and clear the assignment.
    pub fn reset(&self) -> io::Result<()> {
        self.file.set_len(REGION_SIZE)?;
        self.write_region(0, &encode(None))?;
        self.flush(false)
    }

    fn read_region(&self, logical: u64) -> io::Result<Vec<u8>> {
        let mut raw = vec![0u8; REGION_SIZE as usize];
        self.file.read_exact_at(&mut raw, logical)?;
        Ok(raw)
    }

    fn write_region(&self, logical: u64, raw: &[u8]) -> io::Result<()> {
        self.file.write_all_at(raw, logical)
    }
}

fn encode(assignment: Option<&Assignment>) -> Vec<u8> {
    let mut raw = vec![0u8; REGION_SIZE as usize];
    if let Some(assignment) = assignment {
        let bytes = assignment.path.as_bytes();
        debug_assert!(bytes.len() <= MAX_ASSIGNED_PATH);
        LittleEndian::write_u16(&mut raw[..OFFSET_PATH], bytes.len() as u16);
        raw[OFFSET_PATH..OFFSET_PATH + bytes.len()].copy_from_slice(bytes);
        LittleEndian::write_u32(&mut raw[OFFSET_FLAGS..OFFSET_FLAGS + 4], assignment.flags);
    }
    let sum = checksum(&raw[..OFFSET_CHECKSUM]);
    LittleEndian::write_u64(&mut raw[OFFSET_CHECKSUM..], sum);
    raw
}

fn decode(raw: &[u8]) -> Option<Assignment> {
    if raw.len() != REGION_SIZE as usize {
        return None;
    }
    let recorded = LittleEndian::read_u64(&raw[OFFSET_CHECKSUM..]);
    if recorded != checksum(&raw[..OFFSET_CHECKSUM]) {
        return None;
    }
    let len = LittleEndian::read_u16(&raw[..OFFSET_PATH]) as usize;
    if len == 0 || len > MAX_ASSIGNED_PATH {
        return None;
    }
    let path = std::str::from_utf8(&raw[OFFSET_PATH..OFFSET_PATH + len]).ok()?;
    let flags = LittleEndian::read_u32(&raw[OFFSET_FLAGS..OFFSET_FLAGS + 4]);
    Some(Assignment { path: path.to_owned(), flags })
}

fn checksum(bytes: &[u8]) -> u64 {
    // FNV-1a
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
