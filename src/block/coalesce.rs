//! Reuses one substrate transaction across many VFS calls.
//!
//! The substrate is throughput-hostile under fine-grained calls, so the
//! coalescer keeps a transaction open across requests and ends it only at a
//! fence point (`sync`, an unlock to `Shared` or below, `close`). A mutable
//! transaction is opened lazily when the first write appears after the last
//! fence; reads attach to whatever transaction is current. When the
//! substrate auto-commits an idle transaction the failing request is retried
//! once on a fresh one; a second failure surfaces to the caller.

use std::ops::Bound;

use crate::kv::{Database, Direction, Durability, Key, KvError, Row, Transaction, TxMode};

pub struct Coalescer {
    db: Database,
    durability: Durability,
    current: Option<Transaction>,
}

impl Coalescer {
    pub fn new(db: Database, durability: Durability) -> Coalescer {
        Coalescer { db, durability, current: None }
    }

    /// The transaction requests attach to, opening one if needed. A
    /// read-only transaction is replaced when a write shows up; it carries
    /// no buffered state, so nothing is lost.
    fn tx(&mut self, write: bool) -> &mut Transaction {
        let reset = match &self.current {
            Some(tx) => !tx.is_active() || (write && tx.mode() == TxMode::ReadOnly),
            None => true,
        };
        if reset {
            if let Some(tx) = self.current.take() {
                if tx.is_active() {
                    tx.abort();
                }
            }
            let mode = if write { TxMode::ReadWrite } else { TxMode::ReadOnly };
            self.current = Some(self.db.begin(mode, self.durability));
        }
        self.current.as_mut().expect("transaction just ensured")
    }

    fn with_retry<T>(
        &mut self,
        write: bool,
        op: impl Fn(&mut Transaction) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        match op(self.tx(write)) {
            Err(KvError::TransactionInactive) => {
                tracing::debug!("transaction went idle; retrying once on a fresh one");
                self.current = None;
                op(self.tx(write))
            }
            other => other,
        }
    }

    pub fn get(&mut self, key: &Key) -> Result<Option<Row>, KvError> {
        self.with_retry(false, |tx| tx.get(key))
    }

    pub fn put(&mut self, row: Row) -> Result<(), KvError> {
        self.with_retry(true, |tx| tx.put(row.clone()))
    }

    pub fn delete(&mut self, key: &Key) -> Result<(), KvError> {
        self.with_retry(true, |tx| tx.delete(key))
    }

    pub fn delete_range(&mut self, range: (Bound<Key>, Bound<Key>)) -> Result<(), KvError> {
        self.with_retry(true, |tx| tx.delete_range(range.clone()))
    }

    pub fn scan(
        &mut self,
        range: (Bound<Key>, Bound<Key>),
        dir: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, KvError> {
        self.with_retry(false, |tx| tx.scan(range.clone(), dir, limit))
    }

    /// Durability fence: commit the open transaction and wait for the
    /// substrate acknowledgement.
    pub async fn fence(&mut self) -> Result<(), KvError> {
        if let Some(tx) = self.current.take() {
            if tx.is_active() {
                tx.commit().await?;
            }
        }
        Ok(())
    }

    /// End the open transaction without committing anything.
    pub fn discard(&mut self) {
        if let Some(tx) = self.current.take() {
            if tx.is_active() {
                tx.abort();
            }
        }
    }
}
