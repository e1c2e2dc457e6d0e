//! In-memory fire queue.
//!
//! A cache of the durable trigger rows, ordered by `(instant, job_id)` so
//! simultaneous fires dispatch deterministically. At most one entry per job.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};

use crate::types::JobId;

/// One pending fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedFire {
    pub at: DateTime<Utc>,
    pub job_id: JobId,
}

impl Ord for QueuedFire {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap max-heap pops the earliest fire first.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

impl PartialOrd for QueuedFire {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of pending fires with a membership index.
#[derive(Debug, Default)]
pub struct FireQueue {
    heap: BinaryHeap<QueuedFire>,
    index: HashSet<JobId>,
}

impl FireQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a fire. An existing entry for the same job is replaced.
    pub fn push(&mut self, fire: QueuedFire) {
        if self.index.contains(&fire.job_id) {
            self.remove(&fire.job_id);
        }
        self.index.insert(fire.job_id);
        self.heap.push(fire);
    }

    /// Pop the head if it is due at or before `deadline`.
    pub fn pop_due(&mut self, deadline: DateTime<Utc>) -> Option<QueuedFire> {
        if self.heap.peek().is_some_and(|head| head.at <= deadline) {
            let fire = self.heap.pop()?;
            self.index.remove(&fire.job_id);
            Some(fire)
        } else {
            None
        }
    }

    /// Instant of the next pending fire, if any.
    pub fn peek_at(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|f| f.at)
    }

    /// Remove a job's pending fire.
    pub fn remove(&mut self, job_id: &JobId) -> bool {
        if !self.index.remove(job_id) {
            return false;
        }
        let items: Vec<QueuedFire> = self.heap.drain().collect();
        self.heap = items.into_iter().filter(|f| &f.job_id != job_id).collect();
        true
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.index.contains(job_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }
}
