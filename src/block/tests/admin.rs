use super::{context, create_flags, substrate};
use crate::locks::LockLevel;
use crate::vfs::flags::{OpenFlags, SyncFlags};
use crate::vfs::{ReadOutcome, Vfs, VfsError};

/// A database image whose header carries a page size of 4096.
fn image(pages: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; 4096 * pages];
    bytes[16] = 0x10; // 4096 big-endian
    bytes[17] = 0x00;
    for (index, page) in bytes.chunks_mut(4096).enumerate() {
        page[64] = index as u8 + 1;
    }
    bytes
}

#[tokio::test]
async fn import_then_open_reads_the_image() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let admin = vfs.admin();

    let bytes = image(3);
    admin.import("/imported.db", &bytes, None).await.unwrap();
    assert!(admin.exists("/imported.db").await.unwrap());

    let (id, _) = vfs
        .open(Some("/imported.db"), OpenFlags::READ_WRITE | OpenFlags::MAIN_DB)
        .await
        .unwrap();
    vfs.lock(id, LockLevel::Shared).await.unwrap();
    assert_eq!(vfs.file_size(id).await.unwrap(), bytes.len() as u64);
    assert_eq!(vfs.sector_size(id), 4096);

    let mut buf = [0u8; 1];
    assert_eq!(vfs.read(id, &mut buf, 4096 + 64).await.unwrap(), ReadOutcome::Full);
    assert_eq!(buf[0], 2);
    vfs.unlock(id, LockLevel::None).await.unwrap();
    admin.shutdown().await;
}

#[tokio::test]
async fn import_refuses_existing_and_ragged_images() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let admin = vfs.admin();

    admin.import("/a.db", &image(1), None).await.unwrap();
    assert_eq!(admin.import("/a.db", &image(1), None).await.unwrap_err(), VfsError::CantOpen);

    let ragged = vec![0u8; 4096 + 17];
    assert!(admin.import("/b.db", &ragged, Some(4096)).await.is_err());
    admin.shutdown().await;
}

#[tokio::test]
async fn export_round_trips_committed_content() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let admin = vfs.admin();

    let (id, _) = vfs.open(Some("/foo"), create_flags()).await.unwrap();
    vfs.lock(id, LockLevel::Shared).await.unwrap();
    vfs.lock(id, LockLevel::Reserved).await.unwrap();
    let mut content = vec![0u8; 4096 * 2];
    content[0] = 0xAB;
    content[4096] = 0xCD;
    vfs.write(id, &content, 0).await.unwrap();
    vfs.sync(id, SyncFlags::NORMAL).await.unwrap();
    vfs.unlock(id, LockLevel::None).await.unwrap();
    vfs.close(id).await.unwrap();

    let exported = admin.export("/foo").await.unwrap();
    assert_eq!(exported, content);
    admin.shutdown().await;
}

#[tokio::test]
async fn delete_and_clear_remove_files() {
    let (db, reg) = substrate();
    let vfs = context(&db, &reg);
    let admin = vfs.admin();

    admin.import("/a.db", &image(1), None).await.unwrap();
    admin.import("/b.db", &image(1), None).await.unwrap();

    admin.delete("/a.db").await.unwrap();
    assert!(!admin.exists("/a.db").await.unwrap());
    assert!(admin.exists("/b.db").await.unwrap());

    admin.clear().await.unwrap();
    assert!(!admin.exists("/b.db").await.unwrap());
    admin.shutdown().await;
}
