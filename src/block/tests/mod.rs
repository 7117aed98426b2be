mod admin;
mod coalescing;
mod vfs;

use crate::block::{BlockVfs, BlockVfsOptions};
use crate::kv::{Database, Direction, Durability, Key, Row, TxMode};
use crate::locks::advisory::LockRegistry;
use crate::vfs::flags::OpenFlags;

fn substrate() -> (Database, LockRegistry) {
    (Database::open("test"), LockRegistry::new())
}

fn context(db: &Database, registry: &LockRegistry) -> BlockVfs {
    BlockVfs::new(db.clone(), registry.clone(), BlockVfsOptions::default())
}

fn create_flags() -> OpenFlags {
    OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB
}

/// Committed block rows stored for `path`, as `(offset, version)` pairs.
fn block_rows(db: &Database, path: &str) -> Vec<(u64, i64)> {
    let mut tx = db.begin(TxMode::ReadOnly, Durability::Relaxed);
    tx.scan(Key::rows_of(path), Direction::Forward, None)
        .unwrap()
        .into_iter()
        .filter_map(|row| match row {
            Row::Block(b) => Some((b.offset, b.version)),
            _ => None,
        })
        .collect()
}

/// Number of distinct offsets with at least one committed row.
fn distinct_offsets(db: &Database, path: &str) -> usize {
    let mut offsets: Vec<u64> = block_rows(db, path).into_iter().map(|(o, _)| o).collect();
    offsets.dedup();
    offsets.len()
}
