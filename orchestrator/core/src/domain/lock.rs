// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Lock Manager
//!
//! Exclusive, all-or-nothing claims on named resources (file paths, schema files,
//! deployment targets).
//!
//! - [`ResourceLock`] — value object describing one held resource.
//! - [`LockTable`] — the authoritative resource → holder mapping (plain data).
//! - [`ResourceLockManager`] — the table behind a single critical section.
//!
//! # Invariants
//!
//! - A resource has at most one holder; a resource without an entry is free.
//! - A job acquires every resource in its set or none of them.
//! - Locks are always exclusive. There are no shared/read locks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::domain::job::JobId;

/// Lock held by a job on a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Opaque identifier for the locked resource (e.g. file path).
    pub resource: String,
    /// The job currently holding the lock.
    pub held_by: JobId,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    /// Nothing was acquired; these jobs hold at least one requested resource.
    Conflict(BTreeSet<JobId>),
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted)
    }
}

#[derive(Debug, Default, Clone)]
pub struct LockTable {
    locks: HashMap<String, ResourceLock>,
    by_job: HashMap<JobId, BTreeSet<String>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holders (other than `job_id`) of any of the given resources.
    pub fn conflicts(&self, job_id: JobId, resources: &BTreeSet<String>) -> BTreeSet<JobId> {
        resources
            .iter()
            .filter_map(|r| self.locks.get(r))
            .map(|lock| lock.held_by)
            .filter(|holder| *holder != job_id)
            .collect()
    }

    pub fn try_acquire(&mut self, job_id: JobId, resources: &BTreeSet<String>) -> AcquireOutcome {
        let conflicts = self.conflicts(job_id, resources);
        if !conflicts.is_empty() {
            return AcquireOutcome::Conflict(conflicts);
        }

        let now = Utc::now();
        let held = self.by_job.entry(job_id).or_default();
        for resource in resources {
            self.locks.entry(resource.clone()).or_insert_with(|| ResourceLock {
                resource: resource.clone(),
                held_by: job_id,
                acquired_at: now,
            });
            held.insert(resource.clone());
        }
        AcquireOutcome::Granted
    }

    /// Releases everything held by `job_id`. Returns the freed resources; calling it
    /// again for the same job returns an empty set.
    pub fn release(&mut self, job_id: JobId) -> BTreeSet<String> {
        let released = self.by_job.remove(&job_id).unwrap_or_default();
        for resource in &released {
            if self.locks.get(resource).map(|l| l.held_by) == Some(job_id) {
                self.locks.remove(resource);
            }
        }
        released
    }

    pub fn holder(&self, resource: &str) -> Option<JobId> {
        self.locks.get(resource).map(|lock| lock.held_by)
    }

    pub fn held_by(&self, job_id: JobId) -> BTreeSet<String> {
        self.by_job.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn locks(&self) -> impl Iterator<Item = &ResourceLock> {
        self.locks.values()
    }
}

/// Thread-safe lock manager. Every mutation of the table happens inside one
/// `parking_lot::Mutex` critical section.
#[derive(Debug, Default)]
pub struct ResourceLockManager {
    table: Mutex<LockTable>,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, job_id: JobId, resources: &BTreeSet<String>) -> AcquireOutcome {
        self.table.lock().try_acquire(job_id, resources)
    }

    pub fn release(&self, job_id: JobId) -> BTreeSet<String> {
        self.table.lock().release(job_id)
    }

    pub fn conflicts(&self, job_id: JobId, resources: &BTreeSet<String>) -> BTreeSet<JobId> {
        self.table.lock().conflicts(job_id, resources)
    }

    pub fn holder(&self, resource: &str) -> Option<JobId> {
        self.table.lock().holder(resource)
    }

    pub fn held_by(&self, job_id: JobId) -> BTreeSet<String> {
        self.table.lock().held_by(job_id)
    }

    /// Point-in-time copy of every held lock, sorted by resource name.
    pub fn snapshot(&self) -> Vec<ResourceLock> {
        let table = self.table.lock();
        let mut locks: Vec<ResourceLock> = table.locks().cloned().collect();
        locks.sort_by(|a, b| a.resource.cmp(&b.resource));
        locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_acquire_is_all_or_nothing() {
        let mut table = LockTable::new();
        let a = JobId::new();
        let b = JobId::new();

        assert!(table.try_acquire(a, &set(&["x.rs", "y.rs"])).is_granted());

        let outcome = table.try_acquire(b, &set(&["y.rs", "z.rs"]));
        assert_eq!(outcome, AcquireOutcome::Conflict([a].into()));
        // z.rs must not have been taken by the failed request
        assert_eq!(table.holder("z.rs"), None);
        assert!(table.held_by(b).is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut table = LockTable::new();
        let a = JobId::new();
        table.try_acquire(a, &set(&["x.rs"]));

        assert_eq!(table.release(a), set(&["x.rs"]));
        assert!(table.release(a).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_reacquire_by_same_job_is_not_a_conflict() {
        let mut table = LockTable::new();
        let a = JobId::new();
        table.try_acquire(a, &set(&["x.rs"]));
        assert!(table.try_acquire(a, &set(&["x.rs", "y.rs"])).is_granted());
        assert_eq!(table.held_by(a), set(&["x.rs", "y.rs"]));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_manager_snapshot_is_sorted() {
        let manager = ResourceLockManager::new();
        let a = JobId::new();
        manager.try_acquire(a, &set(&["b.rs", "a.rs"]));
        let names: Vec<String> = manager.snapshot().into_iter().map(|l| l.resource).collect();
        assert_eq!(names, vec!["a.rs", "b.rs"]);
        assert_eq!(manager.holder("a.rs"), Some(a));
    }
}
