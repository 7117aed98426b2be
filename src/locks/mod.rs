//! Five-state file-lock state machine over the advisory lock primitive.
//!
//! The engine drives each open file through
//! `None -> Shared -> Reserved -> Pending -> Exclusive` and back. The
//! manager encodes that protocol with three sibling lock names per path:
//! an `outer` gate taken briefly on the way into `Shared` and held for the
//! whole of `Reserved` and above, the `inner` read/write hold, and a
//! `reserved` signal that lets peers refuse an upgrade without blocking.
//! At most one context can hold `Reserved` or higher per path, and
//! `Exclusive` excludes every other hold.

pub mod advisory;

#[cfg(test)]
mod tests;

use std::time::Duration;

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::vfs::{VfsError, VfsResult};
use advisory::{AcquireError, AcquireOptions, LockMode, LockRegistry, LockToken};

/// Engine file-lock levels, ordered from weakest to strongest.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive,
)]
#[repr(u32)]
pub enum LockLevel {
    /// No hold; the file may be neither read nor written.
    None = 0,
    /// Read hold; any number of contexts may share it.
    Shared = 1,
    /// Intent to write. Coexists with `Shared` holds elsewhere, but at most
    /// one context holds `Reserved` or higher per path.
    Reserved = 2,
    /// A writer draining readers on its way to `Exclusive`. Never requested
    /// explicitly; equivalent to `Reserved` for cross-context visibility.
    Pending = 3,
    /// Sole hold; excludes every other level on the path.
    Exclusive = 4,
}

/// Tunables for lock acquisition.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct LockOptions {
    /// Wait bound for entering `Shared` while a writer holds the gate.
    pub shared_timeout: Duration,
    /// Wait bound for the exclusive upgrade; on expiry the previous level is
    /// restored and the caller sees `Busy`.
    pub upgrade_timeout: Duration,
    /// Attempts of the `Reserved` spin before giving up with `Busy`.
    pub reserved_attempts: u32,
    /// Base delay between `Reserved` attempts; doubles each retry.
    pub reserved_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            shared_timeout: Duration::from_secs(1),
            upgrade_timeout: Duration::from_millis(300),
            reserved_attempts: 8,
            reserved_backoff: Duration::from_millis(2),
        }
    }
}

/// Lock name under which a reader advertises its snapshot version, so the
/// block store can bound garbage collection.
pub fn snapshot_name(path: &str, version: i64) -> String {
    format!("{path}#snapshot@{version}")
}

/// Snapshot versions advertised by live readers of `path`.
pub fn live_snapshots(registry: &LockRegistry, path: &str) -> Vec<i64> {
    let prefix = format!("{path}#snapshot@");
    registry
        .query()
        .held
        .iter()
        .filter_map(|info| info.name.strip_prefix(&prefix)?.parse().ok())
        .collect()
}

/// Per-(context, path) lock state machine.
///
/// One manager belongs to one file descriptor; the registry behind it is
/// shared with every other context opening the same path.
pub struct LockManager {
    registry: LockRegistry,
    path: String,
    opts: LockOptions,
    level: LockLevel,
    outer: Option<LockToken>,
    inner: Option<LockToken>,
    reserved: Option<LockToken>,
    snapshot: Option<LockToken>,
}

impl LockManager {
    pub fn new(registry: LockRegistry, path: impl Into<String>, opts: LockOptions) -> Self {
        LockManager {
            registry,
            path: path.into(),
            opts,
            level: LockLevel::None,
            outer: None,
            inner: None,
            reserved: None,
            snapshot: None,
        }
    }

    /// The level this context currently holds.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// The registry this manager coordinates through.
    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    fn outer_name(&self) -> String {
        format!("{}#outer", self.path)
    }

    fn inner_name(&self) -> String {
        format!("{}#inner", self.path)
    }

    fn reserved_name(&self) -> String {
        format!("{}#reserved", self.path)
    }

    /// Move up to `target`. Contention surfaces as [`VfsError::Busy`] with
    /// the previous level restored; transitions outside the engine protocol
    /// surface as [`VfsError::Error`].
    pub async fn lock(&mut self, target: LockLevel) -> VfsResult<()> {
        if target <= self.level {
            return Ok(());
        }
        match (self.level, target) {
            (LockLevel::None, LockLevel::Shared) => self.enter_shared().await,
            (LockLevel::Shared, LockLevel::Reserved) => self.enter_reserved().await,
            (LockLevel::Reserved, LockLevel::Exclusive)
            | (LockLevel::Pending, LockLevel::Exclusive) => self.enter_exclusive().await,
            (LockLevel::Shared, LockLevel::Exclusive) => {
                self.enter_reserved().await?;
                match self.enter_exclusive().await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        // fall all the way back to Shared
                        self.reserved = None;
                        self.outer = None;
                        self.level = LockLevel::Shared;
                        Err(err)
                    }
                }
            }
            (held, wanted) => {
                tracing::warn!(path = %self.path, ?held, ?wanted, "unexpected lock transition");
                Err(VfsError::Error)
            }
        }
    }

    /// Move down to `target` (`Shared` or `None`).
    pub async fn unlock(&mut self, target: LockLevel) -> VfsResult<()> {
        if target >= self.level {
            return Ok(());
        }
        match target {
            LockLevel::Shared => {
                if self.level == LockLevel::Exclusive {
                    self.inner = None;
                    match self.reacquire_inner_shared().await {
                        Ok(token) => self.inner = Some(token),
                        Err(err) => return Err(err),
                    }
                }
                self.reserved = None;
                self.outer = None;
                self.level = LockLevel::Shared;
                Ok(())
            }
            LockLevel::None => {
                self.reserved = None;
                self.outer = None;
                self.inner = None;
                self.snapshot = None;
                self.level = LockLevel::None;
                Ok(())
            }
            _ => {
                tracing::warn!(path = %self.path, held = ?self.level, wanted = ?target,
                    "unexpected unlock transition");
                Err(VfsError::Error)
            }
        }
    }

    /// Whether some context (possibly this one) holds `Reserved` or higher
    /// on the path.
    pub fn check_reserved(&self) -> bool {
        if self.level >= LockLevel::Reserved {
            return true;
        }
        let query = self.registry.query();
        query.is_held(&self.reserved_name()) || query.is_held_exclusive(&self.inner_name())
    }

    /// Advertise the snapshot version this context reads at. Replaces any
    /// previous advertisement.
    pub async fn publish_snapshot(&mut self, version: i64) {
        self.snapshot = None;
        let name = snapshot_name(&self.path, version);
        let opts = AcquireOptions { if_available: true, timeout: None };
        match self.registry.acquire(&name, LockMode::Shared, opts).await {
            Ok(Some(token)) => self.snapshot = Some(token),
            // only exclusive interest could block a shared hold, and nothing
            // ever takes snapshot names exclusively
            Ok(None) | Err(_) => {
                tracing::warn!(path = %self.path, version, "snapshot advertisement refused")
            }
        }
    }

    /// Withdraw the snapshot advertisement.
    pub fn clear_snapshot(&mut self) {
        self.snapshot = None;
    }

    /// `None -> Shared`: briefly take the outer gate, then hold inner
    /// shared. A writer at `Reserved` or above holds the gate, so new
    /// readers queue behind it exactly as a `Pending` lock demands.
    async fn enter_shared(&mut self) -> VfsResult<()> {
        let opts =
            AcquireOptions { if_available: false, timeout: Some(self.opts.shared_timeout) };
        let outer = match self.registry.acquire(&self.outer_name(), LockMode::Exclusive, opts).await
        {
            Ok(Some(token)) => token,
            Ok(None) => return Err(VfsError::Busy),
            Err(AcquireError::Timeout) => return Err(VfsError::Busy),
        };
        let inner = match self.registry.acquire(&self.inner_name(), LockMode::Shared, opts).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(VfsError::Busy),
            Err(AcquireError::Timeout) => return Err(VfsError::Busy),
        };
        drop(outer);
        self.inner = Some(inner);
        self.level = LockLevel::Shared;
        Ok(())
    }

    /// `Shared -> Reserved`: win the outer gate without blocking, then take
    /// the reserved signal. A held signal means a peer writer is underway
    /// and the caller should see `Busy` immediately; a gate held without the
    /// signal is a reader passing through, worth a bounded spin.
    async fn enter_reserved(&mut self) -> VfsResult<()> {
        let nonblocking = AcquireOptions { if_available: true, timeout: None };
        let mut delay = self.opts.reserved_backoff;
        for _ in 0..self.opts.reserved_attempts {
            match self.registry.acquire(&self.outer_name(), LockMode::Exclusive, nonblocking).await
            {
                Ok(Some(outer)) => {
                    let reserved = match self
                        .registry
                        .acquire(&self.reserved_name(), LockMode::Exclusive, nonblocking)
                        .await
                    {
                        Ok(Some(token)) => token,
                        _ => {
                            tracing::warn!(path = %self.path,
                                "reserved signal held without the outer gate");
                            return Err(VfsError::Busy);
                        }
                    };
                    self.outer = Some(outer);
                    self.reserved = Some(reserved);
                    self.level = LockLevel::Reserved;
                    return Ok(());
                }
                Ok(None) => {
                    if self.registry.query().is_held(&self.reserved_name()) {
                        return Err(VfsError::Busy);
                    }
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(_) => return Err(VfsError::Busy),
            }
        }
        Err(VfsError::Busy)
    }

    /// `Reserved -> Exclusive`: swap the inner hold from shared to
    /// exclusive under a bounded wait, then drop the reserved signal. On
    /// expiry the shared hold is restored and the caller sees `Busy`.
    async fn enter_exclusive(&mut self) -> VfsResult<()> {
        self.inner = None;
        let opts =
            AcquireOptions { if_available: false, timeout: Some(self.opts.upgrade_timeout) };
        match self.registry.acquire(&self.inner_name(), LockMode::Exclusive, opts).await {
            Ok(Some(token)) => {
                self.inner = Some(token);
                self.reserved = None;
                self.level = LockLevel::Exclusive;
                Ok(())
            }
            Ok(None) | Err(AcquireError::Timeout) => {
                let token = self.reacquire_inner_shared().await?;
                self.inner = Some(token);
                self.level = LockLevel::Reserved;
                Err(VfsError::Busy)
            }
        }
    }

    /// Regain the inner shared hold after dropping a stronger one. While
    /// this context holds the outer gate no new exclusive interest can form
    /// on `inner`, so the wait is bounded by current holders only.
    async fn reacquire_inner_shared(&mut self) -> VfsResult<LockToken> {
        match self.registry.acquire(&self.inner_name(), LockMode::Shared, AcquireOptions::default()).await
        {
            Ok(Some(token)) => Ok(token),
            _ => {
                tracing::error!(path = %self.path, "failed to restore the inner shared hold");
                self.outer = None;
                self.reserved = None;
                self.inner = None;
                self.level = LockLevel::None;
                Err(VfsError::Error)
            }
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        // token drops release everything; order mirrors an unlock to None
        self.reserved = None;
        self.outer = None;
        self.inner = None;
        self.snapshot = None;
    }
}
