use std::io;

use tempfile::TempDir;

use crate::locks::advisory::LockRegistry;
use crate::locks::LockLevel;
use crate::pool::{PoolOptions, PoolVfs};
use crate::vfs::flags::{OpenFlags, SyncFlags};
use crate::vfs::{ReadOutcome, Vfs, VfsError};

fn create_flags() -> OpenFlags {
    OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB
}

async fn pool_at(dir: &TempDir, capacity: usize) -> PoolVfs {
    PoolVfs::open_pool(
        dir.path(),
        LockRegistry::new(),
        PoolOptions { capacity, ..PoolOptions::default() },
    )
    .await
    .expect("pool opens")
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let dir = TempDir::new().unwrap();
    let pool = pool_at(&dir, 2).await;

    let (id, _) = pool.open(Some("/foo"), create_flags()).await.unwrap();
    pool.lock(id, LockLevel::Shared).await.unwrap();
    pool.lock(id, LockLevel::Reserved).await.unwrap();
    pool.lock(id, LockLevel::Exclusive).await.unwrap();

    let text = b"the quick brown fox jumps over the lazy dog";
    pool.write(id, text, 0).await.unwrap();
    pool.sync(id, SyncFlags::NORMAL).await.unwrap();

    let mut buf = [0u8; 19];
    assert_eq!(pool.read(id, &mut buf, 10).await.unwrap(), ReadOutcome::Full);
    assert_eq!(&buf, b"wn fox jumps over t");
    assert_eq!(pool.file_size(id).await.unwrap(), text.len() as u64);

    pool.unlock(id, LockLevel::None).await.unwrap();
    pool.close(id).await.unwrap();
}

#[tokio::test]
async fn short_read_zero_fills_the_tail() {
    let dir = TempDir::new().unwrap();
    let pool = pool_at(&dir, 1).await;

    let (id, _) = pool.open(Some("/foo"), create_flags()).await.unwrap();
    pool.write(id, &[0x5A; 8192], 0).await.unwrap();
    pool.truncate(id, 4096).await.unwrap();
    assert_eq!(pool.file_size(id).await.unwrap(), 4096);

    let mut buf = [0xFFu8; 100];
    assert_eq!(pool.read(id, &mut buf, 4000).await.unwrap(), ReadOutcome::Short);
    assert_eq!(&buf[..96], &[0x5A; 96]);
    assert_eq!(&buf[96..], &[0x00; 4]);
}

#[tokio::test]
async fn assignments_survive_a_pool_restart() {
    let dir = TempDir::new().unwrap();
    {
        let pool = pool_at(&dir, 2).await;
        let (id, _) = pool.open(Some("/keep.db"), create_flags()).await.unwrap();
        pool.write(id, b"persisted", 0).await.unwrap();
        pool.sync(id, SyncFlags::NORMAL).await.unwrap();
        pool.close(id).await.unwrap();
    }

    let pool = pool_at(&dir, 2).await;
    assert!(pool.access("/keep.db", crate::vfs::flags::AccessCheck::Exists).await.unwrap());
    assert_eq!(pool.used(), 1);

    let (id, _) = pool
        .open(Some("/keep.db"), OpenFlags::READ_WRITE | OpenFlags::MAIN_DB)
        .await
        .unwrap();
    let mut buf = [0u8; 9];
    assert_eq!(pool.read(id, &mut buf, 0).await.unwrap(), ReadOutcome::Full);
    assert_eq!(&buf, b"persisted");
}

#[tokio::test]
async fn delete_on_close_returns_the_handle() {
    let dir = TempDir::new().unwrap();
    let pool = pool_at(&dir, 1).await;

    let (id, _) = pool
        .open(Some("/temp.db"), create_flags() | OpenFlags::DELETE_ON_CLOSE)
        .await
        .unwrap();
    pool.write(id, &[1u8; 1024], 0).await.unwrap();
    pool.close(id).await.unwrap();

    assert!(!pool.access("/temp.db", crate::vfs::flags::AccessCheck::Exists).await.unwrap());
    assert_eq!(pool.used(), 0);

    // the lone handle is free again
    let (id, _) = pool.open(Some("/next.db"), create_flags()).await.unwrap();
    pool.close(id).await.unwrap();
}

#[tokio::test]
async fn exhausted_pool_refuses_new_files() {
    let dir = TempDir::new().unwrap();
    let pool = pool_at(&dir, 1).await;

    let (id, _) = pool.open(Some("/a.db"), create_flags()).await.unwrap();
    assert_eq!(
        pool.open(Some("/b.db"), create_flags()).await.unwrap_err(),
        VfsError::CantOpen
    );
    pool.close(id).await.unwrap();

    // capacity can be grown at runtime
    pool.add_capacity(1).unwrap();
    let (a, _) = pool.open(Some("/a.db"), OpenFlags::READ_WRITE).await.unwrap();
    let (b, _) = pool.open(Some("/b.db"), create_flags()).await.unwrap();
    pool.close(a).await.unwrap();
    pool.close(b).await.unwrap();

    assert_eq!(pool.capacity(), 2);
    // only unassigned handles can be reclaimed
    assert_eq!(pool.reduce_capacity(8).unwrap(), 0);
    pool.delete("/b.db", false).await.unwrap();
    assert_eq!(pool.reduce_capacity(8).unwrap(), 1);
    assert_eq!(pool.capacity(), 1);
}

#[tokio::test]
async fn one_owner_per_pool_directory() {
    let dir = TempDir::new().unwrap();
    let registry = LockRegistry::new();
    let _first = PoolVfs::open_pool(dir.path(), registry.clone(), PoolOptions::default())
        .await
        .unwrap();
    let second = PoolVfs::open_pool(dir.path(), registry, PoolOptions::default()).await;
    assert_eq!(second.err().map(|e| e.kind()), Some(io::ErrorKind::AddrInUse));
}

#[tokio::test]
async fn torn_region_reclaims_the_handle() {
    let dir = TempDir::new().unwrap();
    {
        let pool = pool_at(&dir, 1).await;
        let (id, _) = pool.open(Some("/fragile.db"), create_flags()).await.unwrap();
        pool.write(id, &[9u8; 64], 0).await.unwrap();
        pool.close(id).await.unwrap();
    }

    // flip a byte inside the trailing region
    let victim = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.file_name().unwrap().to_str().unwrap().starts_with("ah-"))
        .unwrap();
    let mut bytes = std::fs::read(&victim).unwrap();
    let index = bytes.len() - 4;
    bytes[index] ^= 0xFF;
    std::fs::write(&victim, &bytes).unwrap();

    let pool = pool_at(&dir, 1).await;
    assert!(!pool.access("/fragile.db", crate::vfs::flags::AccessCheck::Exists).await.unwrap());
    assert_eq!(pool.used(), 0);
    assert_eq!(pool.capacity(), 1);

    // and the reclaimed handle is usable
    let (id, _) = pool.open(Some("/fresh.db"), create_flags()).await.unwrap();
    pool.close(id).await.unwrap();
}

#[tokio::test]
async fn second_open_of_a_claimed_handle_is_refused() {
    let dir = TempDir::new().unwrap();
    let pool = pool_at(&dir, 2).await;
    let (id, _) = pool.open(Some("/a.db"), create_flags()).await.unwrap();
    assert_eq!(
        pool.open(Some("/a.db"), OpenFlags::READ_WRITE).await.unwrap_err(),
        VfsError::CantOpen
    );
    pool.close(id).await.unwrap();
}
