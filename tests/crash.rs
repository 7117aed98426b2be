//! Crash consistency on the block back-end: a context that dies after
//! writing but before the matching sync leaves the pre-batch state behind.

mod common;

use common::{block_context, create_flags, substrate};
use dbvfs::locks::LockLevel;
use dbvfs::vfs::flags::{OpenFlags, SyncFlags};
use dbvfs::vfs::{ReadOutcome, Vfs};

#[tokio::test]
async fn death_before_sync_preserves_the_old_state() {
    let s = substrate();

    {
        let doomed = block_context(&s);
        let (id, _) = doomed.open(Some("/foo"), create_flags()).await.unwrap();
        doomed.lock(id, LockLevel::Shared).await.unwrap();
        doomed.lock(id, LockLevel::Reserved).await.unwrap();
        doomed.write(id, &[b'A'; 4096], 0).await.unwrap();
        doomed.sync(id, SyncFlags::NORMAL).await.unwrap();

        // a second batch dies with the context
        doomed.write(id, &[b'Z'; 4096], 0).await.unwrap();
        doomed.write(id, &[b'Z'; 4096], 4096).await.unwrap();
        drop(doomed);
    }

    let fresh = block_context(&s);
    let (id, _) = fresh
        .open(Some("/foo"), OpenFlags::READ_WRITE | OpenFlags::MAIN_DB)
        .await
        .unwrap();
    fresh.lock(id, LockLevel::Shared).await.unwrap();

    assert_eq!(fresh.file_size(id).await.unwrap(), 4096);
    let mut buf = vec![0u8; 4096];
    assert_eq!(fresh.read(id, &mut buf, 0).await.unwrap(), ReadOutcome::Full);
    assert!(buf.iter().all(|&b| b == b'A'));

    // the dead context's locks went away with it
    fresh.lock(id, LockLevel::Reserved).await.unwrap();
    fresh.lock(id, LockLevel::Exclusive).await.unwrap();
    fresh.unlock(id, LockLevel::None).await.unwrap();
}

#[tokio::test]
async fn death_mid_first_batch_leaves_an_empty_file() {
    let s = substrate();

    {
        let doomed = block_context(&s);
        let (id, _) = doomed.open(Some("/foo"), create_flags()).await.unwrap();
        doomed.lock(id, LockLevel::Shared).await.unwrap();
        doomed.lock(id, LockLevel::Reserved).await.unwrap();
        doomed.write(id, &[1u8; 4096 * 8], 0).await.unwrap();
        drop(doomed);
    }

    let fresh = block_context(&s);
    let (id, _) = fresh
        .open(Some("/foo"), OpenFlags::READ_WRITE | OpenFlags::MAIN_DB)
        .await
        .unwrap();
    fresh.lock(id, LockLevel::Shared).await.unwrap();
    assert_eq!(fresh.file_size(id).await.unwrap(), 0);

    let mut buf = [0xFFu8; 64];
    assert_eq!(fresh.read(id, &mut buf, 0).await.unwrap(), ReadOutcome::Short);
    assert_eq!(buf, [0u8; 64]);
}
