//! Cooperative advisory named-lock primitive shared by every context.
//!
//! A [`LockRegistry`] hands out shared or exclusive holds on arbitrary
//! names. Grants are first-in first-out per name: a shared request queued
//! behind an exclusive request waits its turn, which keeps writers from
//! starving. A hold is released by dropping its [`LockToken`]; [`query`]
//! exposes the currently held and pending sets so callers can make
//! non-blocking decisions.
//!
//! [`query`]: LockRegistry::query

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

/// Sharing mode of a hold on one name.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Any number of shared holds may coexist.
    Shared,
    /// Excludes every other hold on the name.
    Exclusive,
}

/// Options accepted by [`LockRegistry::acquire`].
#[derive(Debug, Copy, Clone, Default)]
pub struct AcquireOptions {
    /// Grant only if no wait would be needed; the call returns `Ok(None)`
    /// instead of queueing.
    pub if_available: bool,
    /// Give up after waiting this long in the queue.
    pub timeout: Option<Duration>,
}

/// Failure modes of [`LockRegistry::acquire`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// The timeout elapsed before the grant arrived.
    Timeout,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::Timeout => f.write_str("lock acquisition timed out"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// One entry of a [`LockQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub name: String,
    pub mode: LockMode,
}

/// Snapshot of the registry: currently held and currently queued requests.
#[derive(Debug, Clone, Default)]
pub struct LockQuery {
    pub held: Vec<LockInfo>,
    pub pending: Vec<LockInfo>,
}

impl LockQuery {
    /// Whether some context holds `name` in any mode.
    pub fn is_held(&self, name: &str) -> bool {
        self.held.iter().any(|info| info.name == name)
    }

    /// Whether some context holds `name` exclusively.
    pub fn is_held_exclusive(&self, name: &str) -> bool {
        self.held.iter().any(|info| info.name == name && info.mode == LockMode::Exclusive)
    }
}

/// The shared registry. Clones refer to the same lock table; every context
/// participating in one database shares a clone.
#[derive(Clone, Default)]
pub struct LockRegistry {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    names: HashMap<String, NameState>,
    next_id: u64,
}

#[derive(Default)]
struct NameState {
    holders: Vec<(u64, LockMode)>,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    id: u64,
    mode: LockMode,
    tx: oneshot::Sender<u64>,
}

impl NameState {
    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => self.holders.is_empty(),
            LockMode::Shared => self.holders.iter().all(|&(_, m)| m == LockMode::Shared),
        }
    }
}

impl Registry {
    fn try_grant(&mut self, name: &str, mode: LockMode) -> Option<u64> {
        let state = self.names.entry(name.to_owned()).or_default();
        if !state.waiters.is_empty() || !state.admits(mode) {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        state.holders.push((id, mode));
        Some(id)
    }

    fn enqueue(&mut self, name: &str, mode: LockMode) -> (u64, oneshot::Receiver<u64>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.names.entry(name.to_owned()).or_default().waiters.push_back(Waiter { id, mode, tx });
        (id, rx)
    }

    /// Grant as many queued requests as the head of the queue allows.
    fn pump(&mut self, name: &str) {
        let Some(state) = self.names.get_mut(name) else { return };
        while let Some(front) = state.waiters.front() {
            if !state.admits(front.mode) {
                break;
            }
            let waiter = state.waiters.pop_front().expect("front exists");
            state.holders.push((waiter.id, waiter.mode));
            if waiter.tx.send(waiter.id).is_err() {
                // the requester gave up; release the grant and keep pumping
                state.holders.retain(|&(id, _)| id != waiter.id);
            }
        }
        if state.holders.is_empty() && state.waiters.is_empty() {
            self.names.remove(name);
        }
    }

    fn release(&mut self, name: &str, id: u64) {
        if let Some(state) = self.names.get_mut(name) {
            state.holders.retain(|&(hid, _)| hid != id);
        }
        self.pump(name);
    }

    /// Remove a queued request. Returns false when the request was already
    /// granted, in which case the caller owns a hold it must release.
    fn cancel(&mut self, name: &str, id: u64) -> bool {
        let removed = match self.names.get_mut(name) {
            Some(state) => {
                let before = state.waiters.len();
                state.waiters.retain(|w| w.id != id);
                state.waiters.len() != before
            }
            None => false,
        };
        self.pump(name);
        removed
    }
}

impl LockRegistry {
    pub fn new() -> LockRegistry {
        LockRegistry::default()
    }

    /// Acquire a hold on `name` in `mode`.
    ///
    /// Returns `Ok(None)` only when `if_available` was set and the name was
    /// busy. A timed-out wait surfaces as [`AcquireError::Timeout`] and
    /// leaves the queue untouched; a grant that races the timeout is kept
    /// and returned as a success.
    pub async fn acquire(
        &self,
        name: &str,
        mode: LockMode,
        opts: AcquireOptions,
    ) -> Result<Option<LockToken>, AcquireError> {
        let (wait_id, mut rx) = {
            let mut reg = self.inner.lock().expect("lock registry poisoned");
            if let Some(id) = reg.try_grant(name, mode) {
                return Ok(Some(self.token(name, mode, id)));
            }
            if opts.if_available {
                return Ok(None);
            }
            reg.enqueue(name, mode)
        };

        match opts.timeout {
            None => match (&mut rx).await {
                Ok(id) => Ok(Some(self.token(name, mode, id))),
                // the registry vanished; treat as a timeout-shaped failure
                Err(_) => Err(AcquireError::Timeout),
            },
            Some(timeout) => {
                tokio::select! {
                    granted = &mut rx => match granted {
                        Ok(id) => Ok(Some(self.token(name, mode, id))),
                        Err(_) => Err(AcquireError::Timeout),
                    },
                    _ = tokio::time::sleep(timeout) => {
                        let cancelled = {
                            let mut reg = self.inner.lock().expect("lock registry poisoned");
                            reg.cancel(name, wait_id)
                        };
                        if cancelled {
                            return Err(AcquireError::Timeout);
                        }
                        // the grant landed while the timer fired; keep it
                        match rx.try_recv() {
                            Ok(id) => Ok(Some(self.token(name, mode, id))),
                            Err(_) => Err(AcquireError::Timeout),
                        }
                    }
                }
            }
        }
    }

    /// The currently held and pending requests across all names.
    pub fn query(&self) -> LockQuery {
        let reg = self.inner.lock().expect("lock registry poisoned");
        let mut out = LockQuery::default();
        for (name, state) in &reg.names {
            for &(_, mode) in &state.holders {
                out.held.push(LockInfo { name: name.clone(), mode });
            }
            for waiter in &state.waiters {
                out.pending.push(LockInfo { name: name.clone(), mode: waiter.mode });
            }
        }
        out
    }

    fn token(&self, name: &str, mode: LockMode, id: u64) -> LockToken {
        LockToken { registry: Arc::clone(&self.inner), name: name.to_owned(), mode, id }
    }
}

/// A hold on one name. Dropping the token releases the hold and wakes the
/// queue.
pub struct LockToken {
    registry: Arc<Mutex<Registry>>,
    name: String,
    mode: LockMode,
    id: u64,
}

impl LockToken {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if let Ok(mut reg) = self.registry.lock() {
            reg.release(&self.name, self.id);
        }
    }
}
