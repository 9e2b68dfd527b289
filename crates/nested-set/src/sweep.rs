//! Detection and forced release of orphaned tree locks.
//!
//! Locks have no lease: a writer that dies between acquire and release leaves
//! its tree unwritable. These helpers let an operator find such locks by age
//! and clear them.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{Error, Result};
use crate::lock::{LockManager, TreeLock};

/// Locks that have been held for longer than `stale_after` at `now`.
pub fn find_orphaned<L: LockManager + ?Sized>(
    manager: &L,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<TreeLock>> {
    let stale_after = chrono::Duration::from_std(stale_after)
        .map_err(|err| Error::Internal(format!("stale-after out of range: {}", err)))?;
    Ok(manager
        .held()?
        .into_iter()
        .filter(|lock| lock.age(now) > stale_after)
        .collect())
}

/// Force-release every lock [`find_orphaned`] reports. Returns the released locks.
pub fn release_orphaned<L: LockManager + ?Sized>(
    manager: &L,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<TreeLock>> {
    let mut released = Vec::new();
    for lock in find_orphaned(manager, stale_after, now)? {
        if manager.force_release(lock.tree_id)? {
            log::warn!(
                "force-released orphaned lock on tree {} held since {}",
                lock.tree_id,
                lock.acquired_at
            );
            released.push(lock);
        }
    }
    Ok(released)
}
