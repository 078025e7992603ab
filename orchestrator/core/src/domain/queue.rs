// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Job Queue
//!
//! Dispatch ordering for pending (`Queued`/`Waiting`) jobs:
//!
//! | Key component | Meaning |
//! |---------------|---------|
//! | `rank` | position of the job kind in the configured priority order (0 = highest) |
//! | `lane` | 0 for urgent jobs, 1 otherwise; urgent jobs lead their class |
//! | `seq`  | arrival sequence number, FIFO within a lane |
//!
//! The queue only orders. Ceilings, locks and preconditions are applied by the
//! coordinator while it walks the queue in this order.

use std::collections::{BTreeMap, HashMap};

use crate::domain::job::{JobId, JobKind};

/// Priority order of job kinds, highest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityOrder {
    order: Vec<JobKind>,
}

impl PriorityOrder {
    /// `order` must contain every kind exactly once (checked by config validation);
    /// kinds missing from it rank after all listed ones.
    pub fn new(order: Vec<JobKind>) -> Self {
        Self { order }
    }

    pub fn rank(&self, kind: JobKind) -> u8 {
        self.order
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.order.len()) as u8
    }

    pub fn kinds(&self) -> &[JobKind] {
        &self.order
    }
}

impl Default for PriorityOrder {
    fn default() -> Self {
        Self::new(JobKind::ALL.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct QueueKey {
    rank: u8,
    lane: u8,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct JobQueue {
    priority: PriorityOrder,
    entries: BTreeMap<QueueKey, JobId>,
    keys: HashMap<JobId, QueueKey>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new(priority: PriorityOrder) -> Self {
        Self {
            priority,
            entries: BTreeMap::new(),
            keys: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Enqueue a job. Re-pushing a job that is already queued keeps its place.
    pub fn push(&mut self, id: JobId, kind: JobKind, urgent: bool) {
        if self.keys.contains_key(&id) {
            return;
        }
        let key = QueueKey {
            rank: self.priority.rank(kind),
            lane: if urgent { 0 } else { 1 },
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, id);
        self.keys.insert(id, key);
    }

    pub fn remove(&mut self, id: JobId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Head of the queue, without removing it.
    pub fn next(&self) -> Option<JobId> {
        self.entries.values().next().copied()
    }

    /// Pending jobs in dispatch order.
    pub fn ordered(&self) -> Vec<JobId> {
        self.entries.values().copied().collect()
    }

    /// Zero-based dispatch position.
    pub fn position(&self, id: JobId) -> Option<usize> {
        let key = self.keys.get(&id)?;
        Some(self.entries.range(..*key).count())
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
