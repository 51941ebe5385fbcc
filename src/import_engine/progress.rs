//! Progress aggregator - atomic per-job counters
//!
//! Counters are bumped once per terminal transition and never re-derived by
//! scanning unit rows, so concurrent workers cannot lose updates. Reads on
//! the hot path are wait-free.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::job::UnitCounts;
use crate::domain::unit::UnitState;

/// Live counters for one job
#[derive(Debug, Default)]
pub struct JobProgress {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time view of a job's progress
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub percent: f64,
}

impl JobProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Seed the counters from durable state (resume/recovery).
    pub fn seed(counts: UnitCounts) -> Self {
        Self {
            total: AtomicU64::new(counts.total),
            succeeded: AtomicU64::new(counts.succeeded),
            failed: AtomicU64::new(counts.failed),
            skipped: AtomicU64::new(counts.skipped),
        }
    }

    /// Record one terminal transition. Non-terminal states are ignored.
    pub fn record(&self, state: UnitState) {
        match state {
            UnitState::Succeeded => {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            UnitState::Failed | UnitState::Invalid => {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
            UnitState::Skipped => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    pub fn counts(&self) -> UnitCounts {
        UnitCounts {
            total: self.total.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let counts = self.counts();
        ProgressSnapshot::from_counts(counts)
    }

    /// All units terminal - the run can finalize.
    pub fn finalized(&self) -> bool {
        self.counts().all_terminal()
    }
}

impl ProgressSnapshot {
    pub fn from_counts(counts: UnitCounts) -> Self {
        let terminal = counts.terminal();
        let percent = if counts.total == 0 {
            0.0
        } else {
            (terminal as f64 / counts.total as f64) * 100.0
        };
        Self {
            total: counts.total,
            pending: counts.pending(),
            succeeded: counts.succeeded,
            failed: counts.failed,
            skipped: counts.skipped,
            percent,
        }
    }
}

/// Process-wide registry of live job progress handles
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<JobProgress>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job for a run, seeding from its durable counts.
    pub async fn register(&self, job_id: Uuid, counts: UnitCounts) -> Arc<JobProgress> {
        let progress = Arc::new(JobProgress::seed(counts));
        let mut jobs = self.jobs.write().await;
        jobs.insert(job_id, Arc::clone(&progress));
        progress
    }

    pub async fn handle(&self, job_id: Uuid) -> Option<Arc<JobProgress>> {
        let jobs = self.jobs.read().await;
        jobs.get(&job_id).cloned()
    }

    pub async fn deregister(&self, job_id: Uuid) {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_terminal_transitions() {
        let progress = JobProgress::new(4);
        progress.record(UnitState::Succeeded);
        progress.record(UnitState::Failed);
        progress.record(UnitState::Skipped);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.pending, 1);
        assert!(!progress.finalized());

        progress.record(UnitState::Succeeded);
        assert!(progress.finalized());
        assert_eq!(progress.snapshot().percent, 100.0);
    }

    #[test]
    fn non_terminal_states_are_ignored() {
        let progress = JobProgress::new(2);
        progress.record(UnitState::Pending);
        progress.record(UnitState::Processing);
        progress.record(UnitState::Validated);
        assert_eq!(progress.snapshot().pending, 2);
    }

    #[test]
    fn invalid_counts_as_failed() {
        let progress = JobProgress::new(1);
        progress.record(UnitState::Invalid);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert!(progress.finalized());
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let progress = Arc::new(JobProgress::new(100));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let progress = Arc::clone(&progress);
            handles.push(tokio::spawn(async move {
                progress.record(UnitState::Succeeded);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(progress.snapshot().succeeded, 100);
        assert!(progress.finalized());
    }

    #[tokio::test]
    async fn registry_lifecycle() {
        let registry = ProgressRegistry::new();
        let job_id = Uuid::new_v4();
        assert!(registry.handle(job_id).await.is_none());

        let progress = registry
            .register(
                job_id,
                UnitCounts {
                    total: 5,
                    succeeded: 2,
                    failed: 0,
                    skipped: 1,
                },
            )
            .await;
        assert_eq!(progress.snapshot().pending, 2);
        assert!(registry.handle(job_id).await.is_some());

        registry.deregister(job_id).await;
        assert!(registry.handle(job_id).await.is_none());
    }
}
