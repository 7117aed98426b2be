//! Versioned block resolution, write staging and purge.
//!
//! A file is sliced into fixed-size blocks; every overwrite of a block
//! creates a new row whose version is smaller than any previous one for the
//! same address. A reader resolves an address to the first row at or above
//! its snapshot version, which an ascending scan yields directly. Rows a
//! batch supersedes stay behind for readers holding older snapshots and are
//! collected by the bounded purge pass once nobody can reach them.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

use moka::sync::Cache;

use crate::kv::{BlockRow, Direction, Key, KvError, MetadataRow, Row};
use crate::locks::advisory::LockRegistry;
use crate::locks::live_snapshots;
use crate::vfs::ReadOutcome;

use super::coalesce::Coalescer;

/// Read cache keyed by `(generation, offset, snapshot)`. A resolution is
/// immutable for a given snapshot, and the generation pins the file
/// incarnation, so entries never go stale.
pub type BlockCache = Cache<(u64, u64, i64), Arc<Vec<u8>>>;

pub fn load_metadata(co: &mut Coalescer, path: &str) -> Result<Option<MetadataRow>, KvError> {
    Ok(match co.get(&Key::metadata(path))? {
        Some(Row::Metadata(meta)) => Some(meta),
        _ => None,
    })
}

pub fn put_metadata(co: &mut Coalescer, meta: MetadataRow) -> Result<(), KvError> {
    co.put(Row::Metadata(meta))
}

/// Resolve one block address to the newest image visible at `snapshot`.
pub fn resolve_block(
    co: &mut Coalescer,
    cache: Option<(&BlockCache, u64)>,
    path: &str,
    offset: u64,
    snapshot: i64,
) -> Result<Option<Arc<Vec<u8>>>, KvError> {
    if let Some((cache, generation)) = cache {
        if let Some(hit) = cache.get(&(generation, offset, snapshot)) {
            return Ok(Some(hit));
        }
    }
    let range = (
        Bound::Included(Key::block(path, offset, snapshot)),
        Bound::Included(Key::block(path, offset, i64::MAX)),
    );
    match co.scan(range, Direction::Forward, Some(1))?.into_iter().next() {
        Some(Row::Block(row)) => {
            let data = Arc::new(row.data);
            if let Some((cache, generation)) = cache {
                cache.insert((generation, offset, snapshot), Arc::clone(&data));
            }
            Ok(Some(data))
        }
        _ => Ok(None),
    }
}

/// Fill `buf` from the file content visible at `snapshot`, zero-filling
/// holes and anything past `file_size`.
#[allow(clippy::too_many_arguments)]
pub fn read_range(
    co: &mut Coalescer,
    cache: Option<(&BlockCache, u64)>,
    path: &str,
    block_size: u32,
    file_size: u64,
    snapshot: i64,
    buf: &mut [u8],
    offset: u64,
) -> Result<ReadOutcome, KvError> {
    buf.fill(0);
    if buf.is_empty() {
        return Ok(ReadOutcome::Full);
    }
    let len = buf.len() as u64;
    let end = file_size.min(offset.saturating_add(len));
    if offset < end {
        let bs = block_size as u64;
        let mut pos = offset;
        while pos < end {
            let block_off = pos - pos % bs;
            if let Some(data) = resolve_block(co, cache, path, block_off, snapshot)? {
                let from = (pos - block_off) as usize;
                let until = (((block_off + bs).min(end)) - block_off) as usize;
                let until = until.min(data.len());
                if from < until {
                    let dst = (pos - offset) as usize;
                    buf[dst..dst + (until - from)].copy_from_slice(&data[from..until]);
                }
            }
            pos = block_off + bs;
        }
    }
    if offset.saturating_add(len) > file_size {
        Ok(ReadOutcome::Short)
    } else {
        Ok(ReadOutcome::Full)
    }
}

/// Stage `data` into the open batch as whole-block images stamped with the
/// batch version. A partial overwrite merges with the newest image visible
/// to the batch, its own staged rows included.
pub fn stage_write(
    co: &mut Coalescer,
    path: &str,
    block_size: u32,
    batch_version: i64,
    touched: &mut BTreeSet<u64>,
    data: &[u8],
    offset: u64,
) -> Result<(), KvError> {
    let bs = block_size as usize;
    let mut pos = 0usize;
    while pos < data.len() {
        let abs = offset + pos as u64;
        let block_off = abs - abs % bs as u64;
        let within = (abs - block_off) as usize;
        let take = (bs - within).min(data.len() - pos);
        let image = if within == 0 && take == bs {
            data[pos..pos + bs].to_vec()
        } else {
            let mut image = match resolve_block(co, None, path, block_off, batch_version)? {
                Some(existing) => {
                    let mut image = existing.as_ref().clone();
                    image.resize(bs, 0);
                    image
                }
                None => vec![0; bs],
            };
            image[within..within + take].copy_from_slice(&data[pos..pos + take]);
            image
        };
        co.put(Row::Block(BlockRow {
            path: path.to_owned(),
            offset: block_off,
            version: batch_version,
            data: image,
        }))?;
        touched.insert(block_off);
        pos += take;
    }
    Ok(())
}

/// Bounded garbage collection of superseded block versions.
///
/// Consults the snapshot advertisements published through the advisory
/// registry and never deletes a row still reachable from a live snapshot or
/// from the committed head. Deletes at most `limit` rows per pass; offsets
/// with work left stay in the marker.
pub fn purge_pass(
    co: &mut Coalescer,
    registry: &LockRegistry,
    path: &str,
    meta: &MetadataRow,
    limit: usize,
) -> Result<usize, KvError> {
    let marker = match co.get(&Key::purge(path))? {
        Some(Row::Purge(marker)) => marker,
        _ => return Ok(0),
    };
    let readers = live_snapshots(registry, path);

    let mut deleted = 0usize;
    let mut remaining = Vec::new();
    for &offset in &marker.offsets {
        if deleted >= limit {
            remaining.push(offset);
            continue;
        }
        let rows = co.scan(Key::versions_of(path, offset), Direction::Forward, None)?;
        let versions: Vec<i64> = rows
            .iter()
            .filter_map(|row| match row {
                Row::Block(b) => Some(b.version),
                _ => None,
            })
            .collect();
        if versions.is_empty() {
            continue;
        }

        // the committed head needs its resolution only while the block is
        // inside the file; every live reader pins its own resolution
        let head_keep = if offset < meta.file_size {
            versions.iter().copied().find(|&v| v >= meta.max_version)
        } else {
            None
        };
        let mut keep: BTreeSet<i64> = head_keep.into_iter().collect();
        for &snap in &readers {
            if snap == meta.max_version {
                // reads at the head share its metadata; the head rule covers them
                continue;
            }
            if let Some(v) = versions.iter().copied().find(|&v| v >= snap) {
                keep.insert(v);
            }
        }

        let mut exhausted = false;
        for &version in &versions {
            if keep.contains(&version) {
                continue;
            }
            if deleted >= limit {
                exhausted = true;
                break;
            }
            co.delete(&Key::block(path, offset, version))?;
            deleted += 1;
        }
        // rows pinned by a reader snapshot become collectable once the
        // reader goes away, so the offset stays on the marker
        if exhausted || keep.iter().any(|&v| Some(v) != head_keep) {
            remaining.push(offset);
        }
    }

    if remaining.is_empty() {
        co.delete(&Key::purge(path))?;
    } else {
        co.put(Row::Purge(crate::kv::PurgeRow { path: path.to_owned(), offsets: remaining }))?;
    }
    Ok(deleted)
}
