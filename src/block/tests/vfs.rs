use super::{context, create_flags, substrate};
use crate::locks::LockLevel;
use crate::vfs::flags::{ControlOp, DeviceCaps, OpenFlags, SyncFlags};
use crate::vfs::{ReadOutcome, Vfs, VfsError};

#[tokio::test]
async fn open_without_create_fails() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let err = vfs
        .open(Some("/missing.db"), OpenFlags::READ_WRITE | OpenFlags::MAIN_DB)
        .await
        .unwrap_err();
    assert_eq!(err, VfsError::CantOpen);
}

#[tokio::test]
async fn exclusive_create_refuses_existing() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/data.db"), create_flags()).await.unwrap();
    vfs.close(id).await.unwrap();

    let err = vfs
        .open(Some("/data.db"), create_flags() | OpenFlags::EXCLUSIVE)
        .await
        .unwrap_err();
    assert_eq!(err, VfsError::CantOpen);
}

#[tokio::test]
async fn out_flags_echo_the_request() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let asked = create_flags() | OpenFlags::from_bits_retain(0x0100_0000);
    let (id, granted) = vfs.open(Some("/data.db"), asked).await.unwrap();
    assert_eq!(granted, asked);
    vfs.close(id).await.unwrap();
}

#[tokio::test]
async fn anonymous_open_needs_no_name() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (a, _) = vfs.open(None, create_flags() | OpenFlags::TEMP_DB).await.unwrap();
    let (b, _) = vfs.open(None, create_flags() | OpenFlags::TEMP_DB).await.unwrap();
    assert_ne!(a, b);
    vfs.write(a, b"alpha", 0).await.unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(vfs.read(a, &mut buf, 0).await.unwrap(), ReadOutcome::Full);
    assert_eq!(&buf, b"alpha");
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();
    vfs.lock(id, LockLevel::Exclusive).await.unwrap();

    let text = b"the quick brown fox jumps over the lazy dog";
    vfs.write(id, text, 0).await.unwrap();

    // reads observe the pending batch before the sync
    let mut buf = [0u8; 19];
    assert_eq!(vfs.read(id, &mut buf, 10).await.unwrap(), ReadOutcome::Full);
    assert_eq!(&buf, b"wn fox jumps over t");

    vfs.sync(id, SyncFlags::NORMAL).await.unwrap();
    vfs.unlock(id, LockLevel::None).await.unwrap();

    // and the committed state after it
    vfs.lock(id, LockLevel::Shared).await.unwrap();
    let mut buf = [0u8; 19];
    assert_eq!(vfs.read(id, &mut buf, 10).await.unwrap(), ReadOutcome::Full);
    assert_eq!(&buf, b"wn fox jumps over t");
    assert_eq!(vfs.file_size(id).await.unwrap(), text.len() as u64);
    vfs.unlock(id, LockLevel::None).await.unwrap();
    vfs.close(id).await.unwrap();
}

#[tokio::test]
async fn short_read_zero_fills_the_tail() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();
    vfs.write(id, &[0x5A; 8192], 0).await.unwrap();
    vfs.truncate(id, 4096).await.unwrap();
    vfs.sync(id, SyncFlags::NORMAL).await.unwrap();
    vfs.unlock(id, LockLevel::None).await.unwrap();

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    assert_eq!(vfs.file_size(id).await.unwrap(), 4096);

    let mut buf = [0xFFu8; 100];
    assert_eq!(vfs.read(id, &mut buf, 4000).await.unwrap(), ReadOutcome::Short);
    assert_eq!(&buf[..96], &[0x5A; 96]);
    assert_eq!(&buf[96..], &[0x00; 4]);

    // a read entirely past the end is all zeros
    let mut buf = [0xFFu8; 16];
    assert_eq!(vfs.read(id, &mut buf, 9000).await.unwrap(), ReadOutcome::Short);
    assert_eq!(buf, [0u8; 16]);
    vfs.unlock(id, LockLevel::None).await.unwrap();
}

#[tokio::test]
async fn abandoned_batch_rolls_back() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();
    vfs.write(id, b"doomed", 0).await.unwrap();
    // no sync: the unlock abandons the batch
    vfs.unlock(id, LockLevel::None).await.unwrap();

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    assert_eq!(vfs.file_size(id).await.unwrap(), 0);
    let mut buf = [0xFFu8; 6];
    assert_eq!(vfs.read(id, &mut buf, 0).await.unwrap(), ReadOutcome::Short);
    assert_eq!(buf, [0u8; 6]);
    vfs.unlock(id, LockLevel::None).await.unwrap();
}

#[tokio::test]
async fn context_death_before_sync_leaves_pre_batch_state() {
    let (db, reg) = substrate();
    {
        let vfs = context(&db, &reg);
        let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();
        vfs.lock(id, LockLevel::Shared).await.unwrap();
        vfs.lock(id, LockLevel::Reserved).await.unwrap();
        vfs.write(id, b"committed", 0).await.unwrap();
        vfs.sync(id, SyncFlags::NORMAL).await.unwrap();

        vfs.write(id, b"LOST", 0).await.unwrap();
        // the context dies here with the batch unsynced
    }

    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), OpenFlags::READ_WRITE | OpenFlags::MAIN_DB).await.unwrap();
    vfs.lock(id, LockLevel::Shared).await.unwrap();
    let mut buf = [0u8; 9];
    assert_eq!(vfs.read(id, &mut buf, 0).await.unwrap(), ReadOutcome::Full);
    assert_eq!(&buf, b"committed");
    vfs.unlock(id, LockLevel::None).await.unwrap();
}

#[tokio::test]
async fn atomic_write_controls_commit_and_roll_back() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();
    assert!(vfs.device_characteristics(id).contains(DeviceCaps::BATCH_ATOMIC));

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();

    vfs.file_control(id, ControlOp::BeginAtomicWrite).await.unwrap();
    vfs.write(id, b"kept", 0).await.unwrap();
    vfs.file_control(id, ControlOp::CommitAtomicWrite).await.unwrap();

    vfs.file_control(id, ControlOp::BeginAtomicWrite).await.unwrap();
    vfs.write(id, b"gone", 0).await.unwrap();
    vfs.file_control(id, ControlOp::RollbackAtomicWrite).await.unwrap();

    let mut buf = [0u8; 4];
    vfs.read(id, &mut buf, 0).await.unwrap();
    assert_eq!(&buf, b"kept");
    vfs.unlock(id, LockLevel::None).await.unwrap();
}

#[tokio::test]
async fn unknown_file_control_reports_not_found() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();
    assert_eq!(
        vfs.file_control(id, ControlOp::Raw(9999)).await.unwrap_err(),
        VfsError::NotFound
    );
}

#[tokio::test]
async fn block_size_control_only_while_empty() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();

    vfs.file_control(id, ControlOp::BlockSize(8192)).await.unwrap();
    assert_eq!(vfs.sector_size(id), 8192);

    assert_eq!(
        vfs.file_control(id, ControlOp::BlockSize(1000)).await.unwrap_err(),
        VfsError::Error
    );

    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();
    vfs.write(id, &[1u8; 16], 0).await.unwrap();
    vfs.sync(id, SyncFlags::NORMAL).await.unwrap();
    vfs.unlock(id, LockLevel::None).await.unwrap();

    assert_eq!(
        vfs.file_control(id, ControlOp::BlockSize(4096)).await.unwrap_err(),
        VfsError::Error
    );
}

#[tokio::test]
async fn last_error_is_retrievable_and_truncated() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    vfs.open(Some("/absent.db"), OpenFlags::READ_WRITE).await.unwrap_err();

    let mut buf = [0u8; 8];
    let (code, n) = vfs.last_error(&mut buf).unwrap();
    assert_eq!(code, VfsError::CantOpen);
    assert_eq!(n, 8);
    assert_eq!(&buf, b"/absent.");
}

#[tokio::test]
async fn full_pathname_normalises() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    assert_eq!(vfs.full_pathname("file:foo.db?cache=off").unwrap(), "/foo.db");
    assert_eq!(vfs.full_pathname("foo.db").unwrap(), "/foo.db");
}
