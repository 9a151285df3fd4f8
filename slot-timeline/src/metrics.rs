use std::{
    array,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::association::AnalysisStatus;

/// Counters for association transitions and step outcomes.
pub struct AnalysisMetrics {
    entered: [AtomicU64; AnalysisStatus::ALL.len()],
    steps_committed: AtomicU64,
    step_timeouts: AtomicU64,
    conflicts: AtomicU64,
    deferred: AtomicU64,
    slots_inserted: AtomicU64,
    slots_updated: AtomicU64,
    slots_deleted: AtomicU64,
}

impl AnalysisMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_transition(&self, from: AnalysisStatus, to: AnalysisStatus) {
        if from == to {
            return;
        }
        self.entered[to.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, inserted: usize, updated: usize, deleted: usize) {
        self.steps_committed.fetch_add(1, Ordering::Relaxed);
        self.slots_inserted
            .fetch_add(inserted as u64, Ordering::Relaxed);
        self.slots_updated.fetch_add(updated as u64, Ordering::Relaxed);
        self.slots_deleted.fetch_add(deleted as u64, Ordering::Relaxed);
    }

    pub fn record_step_timeout(&self) {
        self.step_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entered(&self, status: AnalysisStatus) -> u64 {
        self.entered[status.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> AnalysisMetricsSnapshot {
        AnalysisMetricsSnapshot {
            entered: AnalysisStatus::ALL
                .iter()
                .map(|status| (*status, self.entered(*status)))
                .collect(),
            steps_committed: self.steps_committed.load(Ordering::Relaxed),
            step_timeouts: self.step_timeouts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            slots_inserted: self.slots_inserted.load(Ordering::Relaxed),
            slots_updated: self.slots_updated.load(Ordering::Relaxed),
            slots_deleted: self.slots_deleted.load(Ordering::Relaxed),
        }
    }
}

impl Default for AnalysisMetrics {
    fn default() -> Self {
        Self {
            entered: array::from_fn(|_| AtomicU64::new(0)),
            steps_committed: AtomicU64::new(0),
            step_timeouts: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            slots_inserted: AtomicU64::new(0),
            slots_updated: AtomicU64::new(0),
            slots_deleted: AtomicU64::new(0),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalysisMetricsSnapshot {
    pub entered: Vec<(AnalysisStatus, u64)>,
    pub steps_committed: u64,
    pub step_timeouts: u64,
    pub conflicts: u64,
    pub deferred: u64,
    pub slots_inserted: u64,
    pub slots_updated: u64,
    pub slots_deleted: u64,
}
