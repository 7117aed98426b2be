//! In-process transactional key/value substrate.
//!
//! Models the storage contract the block-store VFS is written against: an
//! indexed object store with composite keys, half-open range scans in either
//! direction, and read/write transactions whose writes are buffered until
//! commit and applied atomically. Dropping a transaction without committing
//! discards its writes, which is how the conformance suite simulates a
//! context dying mid-batch.
//!
//! Real substrates auto-commit a transaction that goes idle; the
//! [`IdlePolicy`] knob reproduces that so the request coalescer's retry path
//! can be exercised.


use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

/// Errors raised by the substrate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KvError {
    /// The transaction committed (explicitly or by going idle) or aborted;
    /// the operation must be retried on a fresh transaction.
    TransactionInactive,
    /// A write was attempted through a read-only transaction.
    ReadOnly,
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::TransactionInactive => f.write_str("transaction is no longer active"),
            KvError::ReadOnly => f.write_str("write through a read-only transaction"),
        }
    }
}

impl std::error::Error for KvError {}

/// Transaction mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Durability the substrate must reach before a commit resolves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Durability {
    /// The commit resolves only once the data is on stable storage.
    Strict,
    /// The commit may resolve before the data is on stable storage.
    Relaxed,
}

/// When an open transaction is considered idle and auto-commits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Transactions live until committed, aborted or dropped.
    #[default]
    Never,
    /// A transaction auto-commits after this many operations; the next
    /// operation fails with [`KvError::TransactionInactive`].
    AfterOps(u32),
}

/// Scan direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// Composite row key: the file path plus a field locating the row within
/// the file. Block addresses order before the named rows, matching the
/// substrate's number-before-string key collation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub path: String,
    pub field: Field,
}

/// Row address within one file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    /// A versioned content block. Versions decrease over time, so the
    /// ascending order within one offset yields the newest row first.
    Block { offset: u64, version: i64 },
    /// The per-file metadata row.
    Metadata,
    /// The purge marker listing offsets with collectable old versions.
    Purge,
}

impl Key {
    pub fn block(path: impl Into<String>, offset: u64, version: i64) -> Key {
        Key { path: path.into(), field: Field::Block { offset, version } }
    }

    pub fn metadata(path: impl Into<String>) -> Key {
        Key { path: path.into(), field: Field::Metadata }
    }

    pub fn purge(path: impl Into<String>) -> Key {
        Key { path: path.into(), field: Field::Purge }
    }

    /// Half-open range covering every version stored for one block address.
    pub fn versions_of(path: &str, offset: u64) -> (Bound<Key>, Bound<Key>) {
        (
            Bound::Included(Key::block(path, offset, i64::MIN)),
            Bound::Included(Key::block(path, offset, i64::MAX)),
        )
    }

    /// Range covering every row of one file, metadata and marker included.
    pub fn rows_of(path: &str) -> (Bound<Key>, Bound<Key>) {
        (
            Bound::Included(Key::block(path, 0, i64::MIN)),
            Bound::Included(Key::purge(path)),
        )
    }

    /// Range covering block rows at or beyond `offset`.
    pub fn blocks_from(path: &str, offset: u64) -> (Bound<Key>, Bound<Key>) {
        (
            Bound::Included(Key::block(path, offset, i64::MIN)),
            Bound::Included(Key::block(path, u64::MAX, i64::MAX)),
        )
    }
}

/// A versioned content block of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub path: String,
    pub offset: u64,
    pub version: i64,
    pub data: Vec<u8>,
}

/// The per-file metadata row. `max_version` is the stamp of the most recent
/// committed batch; the next batch is stamped `max_version - 1`.
/// `generation` is minted when the file is created, so a deleted and
/// recreated file is distinguishable from its predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    pub path: String,
    pub block_size: u32,
    pub generation: u64,
    pub file_size: u64,
    pub max_version: i64,
}

/// Offsets whose superseded versions may be collected once no live snapshot
/// can reach them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeRow {
    pub path: String,
    pub offsets: Vec<u64>,
}

/// A stored row. The key is in-line: it is derived from the row itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Block(BlockRow),
    Metadata(MetadataRow),
    Purge(PurgeRow),
}

impl Row {
    /// The primary key this row lives under.
    pub fn key(&self) -> Key {
        match self {
            Row::Block(b) => Key::block(b.path.clone(), b.offset, b.version),
            Row::Metadata(m) => Key::metadata(m.path.clone()),
            Row::Purge(p) => Key::purge(p.path.clone()),
        }
    }
}

/// A named database. Clones share storage; every context participating in
/// one database holds a clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

struct DbInner {
    name: String,
    state: Mutex<DbState>,
}

#[derive(Default)]
struct DbState {
    rows: BTreeMap<Key, Row>,
    commits: u64,
    idle: IdlePolicy,
}

impl Database {
    /// Open (or create) the named database.
    pub fn open(name: impl Into<String>) -> Database {
        Database {
            inner: Arc::new(DbInner { name: name.into(), state: Mutex::default() }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of commits applied so far.
    pub fn commits(&self) -> u64 {
        self.inner.state.lock().expect("kv state poisoned").commits
    }

    /// Configure the idle auto-commit emulation for transactions opened
    /// after this call.
    pub fn set_idle_policy(&self, policy: IdlePolicy) {
        self.inner.state.lock().expect("kv state poisoned").idle = policy;
    }

    /// Begin a transaction.
    pub fn begin(&self, mode: TxMode, durability: Durability) -> Transaction {
        let idle = self.inner.state.lock().expect("kv state poisoned").idle;
        Transaction {
            db: Arc::clone(&self.inner),
            mode,
            durability,
            idle,
            writes: BTreeMap::new(),
            ops: 0,
            active: true,
        }
    }
}

/// A transaction. Reads merge the committed state with this transaction's
/// own buffered writes; writes become visible to others only at
/// [`Transaction::commit`]. Dropping the value discards the buffer.
pub struct Transaction {
    db: Arc<DbInner>,
    mode: TxMode,
    durability: Durability,
    idle: IdlePolicy,
    writes: BTreeMap<Key, Option<Row>>,
    ops: u32,
    active: bool,
}

impl Transaction {
    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Count an operation against the idle policy. When the budget is
    /// exhausted the transaction auto-commits, and the current operation
    /// fails as inactive.
    fn touch(&mut self) -> Result<(), KvError> {
        if !self.active {
            return Err(KvError::TransactionInactive);
        }
        if let IdlePolicy::AfterOps(budget) = self.idle {
            if self.ops >= budget {
                self.apply();
                return Err(KvError::TransactionInactive);
            }
        }
        self.ops += 1;
        Ok(())
    }

    /// Fetch the row under `key`.
    pub fn get(&mut self, key: &Key) -> Result<Option<Row>, KvError> {
        self.touch()?;
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        let state = self.db.state.lock().expect("kv state poisoned");
        Ok(state.rows.get(key).cloned())
    }

    /// Store `row` under its in-line key.
    pub fn put(&mut self, row: Row) -> Result<(), KvError> {
        self.touch()?;
        if self.mode == TxMode::ReadOnly {
            return Err(KvError::ReadOnly);
        }
        self.writes.insert(row.key(), Some(row));
        Ok(())
    }

    /// Delete the row under `key`, if any.
    pub fn delete(&mut self, key: &Key) -> Result<(), KvError> {
        self.touch()?;
        if self.mode == TxMode::ReadOnly {
            return Err(KvError::ReadOnly);
        }
        self.writes.insert(key.clone(), None);
        Ok(())
    }

    /// Delete every row within `range`.
    pub fn delete_range(&mut self, range: (Bound<Key>, Bound<Key>)) -> Result<(), KvError> {
        self.touch()?;
        if self.mode == TxMode::ReadOnly {
            return Err(KvError::ReadOnly);
        }
        let mut doomed: Vec<Key> = {
            let state = self.db.state.lock().expect("kv state poisoned");
            state.rows.range(range.clone()).map(|(k, _)| k.clone()).collect()
        };
        doomed.extend(self.writes.range(range).map(|(k, _)| k.clone()));
        for key in doomed {
            self.writes.insert(key, None);
        }
        Ok(())
    }

    /// Scan rows within `range` in `dir` order, up to `limit` rows.
    pub fn scan(
        &mut self,
        range: (Bound<Key>, Bound<Key>),
        dir: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, KvError> {
        self.touch()?;
        let mut merged: BTreeMap<Key, Row> = {
            let state = self.db.state.lock().expect("kv state poisoned");
            state.rows.range(range.clone()).map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, write) in self.writes.range(range) {
            match write {
                Some(row) => {
                    merged.insert(key.clone(), row.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        let limit = limit.unwrap_or(usize::MAX);
        let rows = match dir {
            Direction::Forward => merged.into_values().take(limit).collect(),
            Direction::Reverse => merged.into_values().rev().take(limit).collect(),
        };
        Ok(rows)
    }

    fn apply(&mut self) {
        let mut state = self.db.state.lock().expect("kv state poisoned");
        for (key, write) in std::mem::take(&mut self.writes) {
            match write {
                Some(row) => {
                    state.rows.insert(key, row);
                }
                None => {
                    state.rows.remove(&key);
                }
            }
        }
        state.commits += 1;
        self.active = false;
    }

    /// Apply every buffered write atomically and wait until the substrate
    /// acknowledges the requested durability.
    pub async fn commit(mut self) -> Result<(), KvError> {
        if !self.active {
            return Err(KvError::TransactionInactive);
        }
        self.apply();
        if self.durability == Durability::Strict {
            // the in-process store acknowledges on the next scheduler turn
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Discard every buffered write.
    pub fn abort(mut self) {
        self.writes.clear();
        self.active = false;
    }
}
