//! Contention workload: N writers increment one 4-byte counter through
//! locked, batch-atomic transactions and the final value must equal N*M.
//!
//! Run with `cargo run --example contention -- --writers 4 --increments 10000`,
//! or point `--config` at a TOML file with the same knobs.

use std::path::PathBuf;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use clap::Parser;
use serde::Deserialize;

use dbvfs::block::{BlockVfs, BlockVfsOptions};
use dbvfs::kv::Database;
use dbvfs::locks::advisory::LockRegistry;
use dbvfs::locks::LockLevel;
use dbvfs::vfs::flags::{OpenFlags, SyncFlags};
use dbvfs::vfs::{FileId, Vfs, VfsError};

#[derive(Parser)]
#[command(about = "drive concurrent counter increments through the block VFS")]
struct Args {
    /// TOML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of concurrent writer contexts.
    #[arg(long)]
    writers: Option<usize>,
    /// Increments per writer.
    #[arg(long)]
    increments: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    writers: Option<usize>,
    increments: Option<usize>,
    counter_path: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config: Config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).expect("config file readable");
            toml::from_str(&text).expect("config file parses")
        }
        None => Config::default(),
    };
    let writers = args.writers.or(config.writers).unwrap_or(4);
    let increments = args.increments.or(config.increments).unwrap_or(10_000);
    let path = config.counter_path.unwrap_or_else(|| "/counter".to_owned());

    let db = Database::open("contention-demo");
    let registry = LockRegistry::new();

    // seed the counter
    let seeder = BlockVfs::new(db.clone(), registry.clone(), BlockVfsOptions::default());
    let (id, _) = seeder
        .open(Some(&path), OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB)
        .await
        .expect("seed open");
    seeder.lock(id, LockLevel::Shared).await.unwrap();
    seeder.lock(id, LockLevel::Reserved).await.unwrap();
    seeder.write(id, &[0u8; 4], 0).await.unwrap();
    seeder.sync(id, SyncFlags::NORMAL).await.unwrap();
    seeder.unlock(id, LockLevel::None).await.unwrap();
    seeder.close(id).await.unwrap();

    let started = Instant::now();
    let mut tasks = Vec::new();
    for worker in 0..writers {
        let db = db.clone();
        let registry = registry.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            let vfs = BlockVfs::new(db, registry, BlockVfsOptions::default());
            let (id, _) = vfs
                .open(Some(&path), OpenFlags::READ_WRITE | OpenFlags::MAIN_DB)
                .await
                .expect("worker open");
            let mut retries = 0u64;
            for _ in 0..increments {
                let mut backoff = 1u64;
                loop {
                    match increment_once(&vfs, id).await {
                        Ok(()) => break,
                        Err(VfsError::Busy) => {
                            retries += 1;
                            tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                            backoff = (backoff * 2).min(16);
                        }
                        Err(other) => panic!("worker {worker} failed: {other:?}"),
                    }
                }
            }
            vfs.close(id).await.unwrap();
            tracing::info!(worker, retries, "writer done");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let checker = BlockVfs::new(db, registry, BlockVfsOptions::default());
    let (id, _) = checker
        .open(Some(&path), OpenFlags::READ_WRITE | OpenFlags::MAIN_DB)
        .await
        .unwrap();
    checker.lock(id, LockLevel::Shared).await.unwrap();
    let mut counter = [0u8; 4];
    checker.read(id, &mut counter, 0).await.unwrap();
    checker.unlock(id, LockLevel::None).await.unwrap();

    let value = BigEndian::read_u32(&counter);
    let expected = (writers * increments) as u32;
    println!(
        "{value} / {expected} increments in {:.2?} ({} writers)",
        started.elapsed(),
        writers
    );
    assert_eq!(value, expected, "lost updates detected");
}

async fn increment_once(vfs: &BlockVfs, id: FileId) -> Result<(), VfsError> {
    vfs.lock(id, LockLevel::Shared).await?;
    for level in [LockLevel::Reserved, LockLevel::Exclusive] {
        if let Err(err) = vfs.lock(id, level).await {
            vfs.unlock(id, LockLevel::None).await.ok();
            return Err(err);
        }
    }

    let mut counter = [0u8; 4];
    vfs.read(id, &mut counter, 0).await?;
    let next = BigEndian::read_u32(&counter) + 1;
    BigEndian::write_u32(&mut counter, next);
    vfs.write(id, &counter, 0).await?;
    vfs.sync(id, SyncFlags::NORMAL).await?;
    vfs.unlock(id, LockLevel::None).await
}
