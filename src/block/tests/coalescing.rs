use super::{context, create_flags, substrate};
use crate::kv::IdlePolicy;
use crate::locks::LockLevel;
use crate::vfs::flags::SyncFlags;
use crate::vfs::{ReadOutcome, Vfs};

/// An idle auto-commit by the substrate is absorbed by the retry-once
/// policy: the engine never notices.
#[tokio::test]
async fn idle_auto_commit_is_retried_transparently() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();
    for block in 0u8..4 {
        vfs.write(id, &[block + 1; 4096], u64::from(block) * 4096).await.unwrap();
    }
    vfs.sync(id, SyncFlags::NORMAL).await.unwrap();
    vfs.unlock(id, LockLevel::None).await.unwrap();

    // expire transactions aggressively from here on
    db.set_idle_policy(IdlePolicy::AfterOps(2));

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    for block in 0u8..4 {
        let mut buf = [0u8; 64];
        let offset = u64::from(block) * 4096;
        assert_eq!(vfs.read(id, &mut buf, offset).await.unwrap(), ReadOutcome::Full);
        assert_eq!(&buf[..8], &[block + 1; 8]);
    }
    vfs.unlock(id, LockLevel::None).await.unwrap();
}

/// Reads between fences share one transaction; a fence ends it.
#[tokio::test]
async fn fences_bound_transaction_reuse() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();

    let commits_before = db.commits();

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();
    vfs.write(id, &[1u8; 4096], 0).await.unwrap();
    vfs.write(id, &[2u8; 4096], 4096).await.unwrap();
    vfs.write(id, &[3u8; 4096], 8192).await.unwrap();
    vfs.sync(id, SyncFlags::NORMAL).await.unwrap();
    vfs.unlock(id, LockLevel::None).await.unwrap();

    // one batch commit plus at most one purge commit, never one per write
    let commits = db.commits() - commits_before;
    assert!(commits <= 2, "expected coalesced commits, saw {commits}");

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    let mut buf = [0u8; 4096];
    vfs.read(id, &mut buf, 4096).await.unwrap();
    assert_eq!(buf[0], 2);
    vfs.unlock(id, LockLevel::None).await.unwrap();
}
