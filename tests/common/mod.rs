//! Shared helpers for the conformance suite.
#![allow(dead_code)]

use dbvfs::block::{BlockVfs, BlockVfsOptions};
use dbvfs::kv::Database;
use dbvfs::locks::advisory::LockRegistry;
use dbvfs::locks::LockLevel;
use dbvfs::pool::{PoolOptions, PoolVfs};
use dbvfs::vfs::flags::{OpenFlags, SyncFlags};
use dbvfs::vfs::{FileId, Vfs};

/// One shared substrate: contexts created from it see the same files and
/// the same lock table.
#[derive(Clone)]
pub struct Substrate {
    pub db: Database,
    pub registry: LockRegistry,
}

pub fn substrate() -> Substrate {
    Substrate { db: Database::open("conformance"), registry: LockRegistry::new() }
}

pub fn block_context(s: &Substrate) -> BlockVfs {
    BlockVfs::new(s.db.clone(), s.registry.clone(), BlockVfsOptions::default())
}

pub async fn pool_at(dir: &std::path::Path) -> PoolVfs {
    PoolVfs::open_pool(dir, LockRegistry::new(), PoolOptions::default())
        .await
        .expect("pool opens")
}

pub fn create_flags() -> OpenFlags {
    OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB
}

/// Write `data` at `offset` under an exclusive lock and commit it.
pub async fn commit_write(vfs: &dyn Vfs, id: FileId, data: &[u8], offset: u64) {
    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();
    vfs.lock(id, LockLevel::Exclusive).await.unwrap();
    vfs.write(id, data, offset).await.unwrap();
    vfs.sync(id, SyncFlags::NORMAL).await.unwrap();
    vfs.unlock(id, LockLevel::None).await.unwrap();
}
