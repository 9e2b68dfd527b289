use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::{Error, Result, TreeId};

/// Uniqueness key of a tree lock: SHA-1 of `tree_id=<id>`, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TreeLockKey(String);

impl TreeLockKey {
    pub fn for_tree(tree_id: TreeId) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("tree_id={}", tree_id).as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TreeLockKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A held lock on one tree.
///
/// The token tells this holder apart from a later holder of the same tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeLock {
    pub tree_id: TreeId,
    pub key: TreeLockKey,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

impl TreeLock {
    pub(crate) fn new(tree_id: TreeId) -> Self {
        Self {
            tree_id,
            key: TreeLockKey::for_tree(tree_id),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.acquired_at)
    }
}

/// Per-tree mutual exclusion for structural writes.
///
/// `acquire` never waits: when the tree is already locked it fails with
/// [`Error::LockContention`] and the caller decides whether to retry.
pub trait LockManager {
    fn acquire(&self, tree_id: TreeId) -> Result<TreeLock>;

    /// Release `lock` if it is still the live lock of its tree.
    fn release(&self, lock: &TreeLock) -> Result<()>;

    /// Every lock currently held.
    fn held(&self) -> Result<Vec<TreeLock>>;

    /// Drop the lock of `tree_id` whoever holds it. Returns whether one existed.
    fn force_release(&self, tree_id: TreeId) -> Result<bool>;
}

/// Releases its lock when dropped, on every exit path.
///
/// Dropping can only log a failed release; [`TreeLockGuard::release`]
/// reports it.
#[derive(Debug)]
pub struct TreeLockGuard<'a, L: LockManager + ?Sized> {
    manager: &'a L,
    lock: TreeLock,
    released: bool,
}

impl<L: LockManager + ?Sized> TreeLockGuard<'_, L> {
    pub fn lock(&self) -> &TreeLock {
        &self.lock
    }

    /// Release the lock now, returning the error of a failed release.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.lock)?;
        log::info!("released lock for tree {}", self.lock.tree_id);
        Ok(())
    }

    /// The lock was released with a committed store transaction.
    pub(crate) fn dismiss(mut self) {
        self.released = true;
        log::info!("released lock for tree {} on commit", self.lock.tree_id);
    }
}

impl<L: LockManager + ?Sized> Drop for TreeLockGuard<'_, L> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.manager.release(&self.lock) {
            log::warn!(
                "failed to release lock for tree {}. error: {}",
                self.lock.tree_id,
                err
            );
            return;
        }
        log::info!("released lock for tree {}", self.lock.tree_id);
    }
}

/// Acquire the lock of `tree_id`, scoped to the returned guard.
pub fn lock_tree<L: LockManager + ?Sized>(
    manager: &L,
    tree_id: TreeId,
) -> Result<TreeLockGuard<'_, L>> {
    let lock = manager.acquire(tree_id)?;
    log::info!(
        "acquired lock for tree {} (key {})",
        tree_id,
        lock.key.as_str()
    );
    Ok(TreeLockGuard {
        manager,
        lock,
        released: false,
    })
}

/// Locks held in a concurrent map, for writers sharing one process.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    locks: DashMap<TreeId, TreeLock>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for MemoryLockManager {
    fn acquire(&self, tree_id: TreeId) -> Result<TreeLock> {
        match self.locks.entry(tree_id) {
            Entry::Occupied(_) => Err(Error::LockContention { tree_id }),
            Entry::Vacant(slot) => {
                let lock = TreeLock::new(tree_id);
                slot.insert(lock.clone());
                Ok(lock)
            }
        }
    }

    fn release(&self, lock: &TreeLock) -> Result<()> {
        if self
            .locks
            .remove_if(&lock.tree_id, |_, held| held.token == lock.token)
            .is_none()
        {
            log::warn!(
                "lock for tree {} was no longer held by token {}",
                lock.tree_id,
                lock.token
            );
        }
        Ok(())
    }

    fn held(&self) -> Result<Vec<TreeLock>> {
        let mut locks: Vec<TreeLock> = self.locks.iter().map(|e| e.value().clone()).collect();
        locks.sort_by_key(|lock| lock.acquired_at);
        Ok(locks)
    }

    fn force_release(&self, tree_id: TreeId) -> Result<bool> {
        Ok(self.locks.remove(&tree_id).is_some())
    }
}
