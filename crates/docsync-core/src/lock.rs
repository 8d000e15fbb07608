//! Per-collection read/write locks.
//!
//! Locks are keyed by path and handed out as owned guards, so a lock can
//! outlive the call that acquired it and be released in a chosen order.
//! Waiting is bounded by the table's timeout. A path's entry is dropped from
//! the table once nobody holds or waits for its lock.

use crate::path::ResourcePath;
use crate::store::{CollectionMeta, StoreError};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default time to wait for a collection lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Requested lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access, no mutation of the locked collection
    Read,
    /// Exclusive access
    Write,
}

impl LockMode {
    /// Whether a lock held in `self` mode also covers `requested`.
    #[must_use]
    pub fn covers(self, requested: Self) -> bool {
        self == Self::Write || requested == Self::Read
    }
}

enum Held {
    Read(#[allow(dead_code)] ArcRwLockReadGuard<RawRwLock, ()>),
    Write(#[allow(dead_code)] ArcRwLockWriteGuard<RawRwLock, ()>),
}

type LockMap = HashMap<ResourcePath, Arc<RwLock<()>>>;

/// An acquired path lock; released on drop.
pub struct PathLock {
    path: ResourcePath,
    mode: LockMode,
    held: Option<Held>,
    table: Arc<Mutex<LockMap>>,
}

impl PathLock {
    /// The locked path.
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The mode the lock is held in.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl fmt::Debug for PathLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathLock")
            .field("path", &self.path)
            .field("mode", &self.mode())
            .finish()
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        drop(self.held.take());
        evict_if_idle(&self.table, &self.path);
        tracing::trace!(path = %self.path, mode = ?self.mode, "Released collection lock");
    }
}

/// Table of read/write locks keyed by path.
pub struct LockTable {
    locks: Arc<Mutex<LockMap>>,
    timeout: Duration,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockTable {
    /// Create a lock table with the given acquisition timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Acquire the lock for `path` in `mode`, waiting at most the timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockTimeout`] if the lock could not be taken in time.
    pub fn acquire(&self, path: &ResourcePath, mode: LockMode) -> Result<PathLock, StoreError> {
        let lock = Arc::clone(self.locks.lock().entry(path.clone()).or_default());

        let held = match mode {
            LockMode::Read => lock.try_read_arc_for(self.timeout).map(Held::Read),
            LockMode::Write => lock.try_write_arc_for(self.timeout).map(Held::Write),
        };

        let Some(held) = held else {
            drop(lock);
            evict_if_idle(&self.locks, path);
            tracing::warn!(path = %path, ?mode, timeout = ?self.timeout, "Timed out waiting for collection lock");
            return Err(StoreError::LockTimeout(path.to_string()));
        };

        tracing::trace!(path = %path, ?mode, "Acquired collection lock");
        Ok(PathLock {
            path: path.clone(),
            mode,
            held: Some(held),
            table: Arc::clone(&self.locks),
        })
    }

    /// Number of paths with a held or awaited lock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no lock is held or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

/// Remove the entry for `path` if only the table still references it.
fn evict_if_idle(table: &Mutex<LockMap>, path: &ResourcePath) {
    let mut table = table.lock();
    if table
        .get(path)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        table.remove(path);
    }
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("paths", &self.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// An open collection together with the lock that guards it.
#[derive(Debug)]
pub struct CollectionGuard {
    meta: CollectionMeta,
    lock: PathLock,
}

impl CollectionGuard {
    /// Pair collection metadata with its acquired lock.
    #[must_use]
    pub fn new(meta: CollectionMeta, lock: PathLock) -> Self {
        Self { meta, lock }
    }

    /// Collection metadata as seen when the lock was taken.
    #[must_use]
    pub fn meta(&self) -> &CollectionMeta {
        &self.meta
    }

    /// Collection path.
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.meta.path
    }

    /// Mode the lock is held in.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.lock.mode()
    }
}
