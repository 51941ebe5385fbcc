//! In-memory job store for tests and embedded use
//!
//! Mirrors the sqlite store's semantics exactly: the mark-terminal guard,
//! the invalid-counts-as-failed rule at insert time, and the timestamp
//! stamping on state transitions all behave the same way.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::job::{ImportJob, JobConfig, JobState, UnitCounts};
use crate::domain::repositories::JobStore;
use crate::domain::unit::{ImportUnit, UnitOutcome, UnitState};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, ImportJob>,
    units: HashMap<Uuid, BTreeMap<u64, ImportUnit>>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn job_mut<'a>(inner: &'a mut Inner, job_id: Uuid) -> Result<&'a mut ImportJob> {
    inner
        .jobs
        .get_mut(&job_id)
        .ok_or_else(|| anyhow!("job {job_id} not found"))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &ImportJob) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            bail!("job {} already exists", job.id);
        }
        inner.jobs.insert(job.id, job.clone());
        inner.units.insert(job.id, BTreeMap::new());
        Ok(())
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<ImportJob>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<ImportJob> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn update_job_state(
        &self,
        job_id: Uuid,
        state: JobState,
        warning: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = job_mut(&mut inner, job_id)?;
        let now = Utc::now();
        if state == JobState::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if state.is_terminal() {
            if job.finished_at.is_none() {
                job.finished_at = Some(now);
            }
        } else {
            // retry-failed re-opens a finished job
            job.finished_at = None;
        }
        job.state = state;
        if warning.is_some() {
            job.warning = warning;
        }
        job.updated_at = now;
        Ok(())
    }

    async fn update_job_config(&self, job_id: Uuid, config: &JobConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = job_mut(&mut inner, job_id)?;
        job.config = config.clone();
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_job_total(&self, job_id: Uuid, total: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = job_mut(&mut inner, job_id)?;
        if job.counts.total != 0 && job.counts.total != total {
            bail!("job {job_id} total already set to {}", job.counts.total);
        }
        job.counts.total = total;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_units(&self, units: &[ImportUnit]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for unit in units {
            if !inner.jobs.contains_key(&unit.job_id) {
                bail!("job {} not found", unit.job_id);
            }
            let slots = inner.units.entry(unit.job_id).or_default();
            if slots.contains_key(&unit.ordinal) {
                bail!("unit ({}, {}) already exists", unit.job_id, unit.ordinal);
            }
            slots.insert(unit.ordinal, unit.clone());
            if unit.state == UnitState::Invalid {
                let job = job_mut(&mut inner, unit.job_id)?;
                job.counts.failed += 1;
            }
        }
        Ok(())
    }

    async fn mark_unit_processing(&self, job_id: Uuid, ordinal: u64, attempt: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let unit = inner
            .units
            .get_mut(&job_id)
            .and_then(|slots| slots.get_mut(&ordinal))
            .ok_or_else(|| anyhow!("unit ({job_id}, {ordinal}) not found"))?;
        unit.state = UnitState::Processing;
        unit.attempts = attempt;
        unit.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_unit_terminal(
        &self,
        job_id: Uuid,
        ordinal: u64,
        outcome: &UnitOutcome,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let unit = inner
            .units
            .get_mut(&job_id)
            .and_then(|slots| slots.get_mut(&ordinal))
            .ok_or_else(|| anyhow!("unit ({job_id}, {ordinal}) not found"))?;
        if unit.state.is_terminal() {
            bail!(
                "unit ({job_id}, {ordinal}) is already terminal in state {}",
                unit.state
            );
        }

        let state = outcome.state();
        unit.state = state;
        unit.failure = None;
        match outcome {
            UnitOutcome::Succeeded { record_id } => {
                unit.record_id = record_id.clone();
            }
            UnitOutcome::Skipped { .. } => {}
            UnitOutcome::Failed { failure } => {
                unit.failure = Some(failure.clone());
            }
        }
        unit.updated_at = Utc::now();

        let job = job_mut(&mut inner, job_id)?;
        match state {
            UnitState::Succeeded => job.counts.succeeded += 1,
            UnitState::Failed => job.counts.failed += 1,
            UnitState::Skipped => job.counts.skipped += 1,
            _ => {}
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_failed_units(&self, job_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let slots = inner
            .units
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;

        let mut reset: u64 = 0;
        for unit in slots.values_mut() {
            if unit.state == UnitState::Failed {
                unit.state = UnitState::Pending;
                unit.failure = None;
                unit.attempts = 0;
                unit.updated_at = Utc::now();
                reset += 1;
            }
        }
        if reset > 0 {
            let job = job_mut(&mut inner, job_id)?;
            job.counts.failed = job.counts.failed.saturating_sub(reset);
            job.updated_at = Utc::now();
        }
        Ok(reset)
    }

    async fn next_dispatchable(
        &self,
        job_id: Uuid,
        from_ordinal: u64,
    ) -> Result<Option<ImportUnit>> {
        let inner = self.inner.read().await;
        let slots = inner
            .units
            .get(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        Ok(slots
            .range(from_ordinal..)
            .map(|(_, unit)| unit)
            .find(|unit| unit.is_dispatchable())
            .cloned())
    }

    async fn units_in_state(&self, job_id: Uuid, state: UnitState) -> Result<Vec<ImportUnit>> {
        let inner = self.inner.read().await;
        let slots = inner
            .units
            .get(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        Ok(slots
            .values()
            .filter(|unit| unit.state == state)
            .cloned()
            .collect())
    }

    async fn find_unit(&self, job_id: Uuid, ordinal: u64) -> Result<Option<ImportUnit>> {
        let inner = self.inner.read().await;
        Ok(inner
            .units
            .get(&job_id)
            .and_then(|slots| slots.get(&ordinal))
            .cloned())
    }

    async fn list_units(&self, job_id: Uuid) -> Result<Vec<ImportUnit>> {
        let inner = self.inner.read().await;
        let slots = inner
            .units
            .get(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        Ok(slots.values().cloned().collect())
    }

    async fn job_counts(&self, job_id: Uuid) -> Result<UnitCounts> {
        let inner = self.inner.read().await;
        let job = inner
            .jobs
            .get(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        Ok(job.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::FileReference;
    use crate::domain::unit::{FailureKind, UnitFailure};
    use crate::import_engine::parser::SourcePosition;
    use serde_json::Map;

    fn job() -> ImportJob {
        ImportJob::new("t", FileReference::new("f"), JobConfig::default(), None)
    }

    fn validated_unit(job_id: Uuid, ordinal: u64) -> ImportUnit {
        let mut unit = ImportUnit::pending(job_id, ordinal, Map::new(), SourcePosition::default());
        unit.state = UnitState::Validated;
        unit.normalized = Some(Map::new());
        unit
    }

    #[tokio::test]
    async fn terminal_write_is_guarded() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();
        store
            .insert_units(&[validated_unit(job.id, 0)])
            .await
            .unwrap();

        let outcome = UnitOutcome::Succeeded {
            record_id: Some("rec-1".to_string()),
        };
        store.mark_unit_terminal(job.id, 0, &outcome).await.unwrap();
        // A second terminal write for the same unit must be rejected.
        assert!(store.mark_unit_terminal(job.id, 0, &outcome).await.is_err());

        let counts = store.job_counts(job.id).await.unwrap();
        assert_eq!(counts.succeeded, 1);
    }

    #[tokio::test]
    async fn invalid_units_count_as_failed_at_insert() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();

        let mut invalid = ImportUnit::pending(job.id, 0, Map::new(), SourcePosition::default());
        invalid.state = UnitState::Invalid;
        store
            .insert_units(&[invalid, validated_unit(job.id, 1)])
            .await
            .unwrap();

        let counts = store.job_counts(job.id).await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn reset_failed_units_restores_dispatchability() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();
        store
            .insert_units(&[validated_unit(job.id, 0), validated_unit(job.id, 1)])
            .await
            .unwrap();

        store
            .mark_unit_terminal(
                job.id,
                0,
                &UnitOutcome::Failed {
                    failure: UnitFailure {
                        kind: FailureKind::Permanent,
                        detail: "boom".to_string(),
                    },
                },
            )
            .await
            .unwrap();
        store
            .mark_unit_terminal(
                job.id,
                1,
                &UnitOutcome::Succeeded { record_id: None },
            )
            .await
            .unwrap();

        let reset = store.reset_failed_units(job.id).await.unwrap();
        assert_eq!(reset, 1);

        let unit = store.find_unit(job.id, 0).await.unwrap().unwrap();
        assert_eq!(unit.state, UnitState::Pending);
        assert!(unit.failure.is_none());
        assert_eq!(unit.attempts, 0);
        assert!(unit.is_dispatchable());

        let counts = store.job_counts(job.id).await.unwrap();
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.succeeded, 1);
    }

    #[tokio::test]
    async fn next_dispatchable_respects_cursor_and_state() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();

        let mut invalid = ImportUnit::pending(job.id, 1, Map::new(), SourcePosition::default());
        invalid.state = UnitState::Invalid;
        store
            .insert_units(&[validated_unit(job.id, 0), invalid, validated_unit(job.id, 2)])
            .await
            .unwrap();

        let first = store.next_dispatchable(job.id, 0).await.unwrap().unwrap();
        assert_eq!(first.ordinal, 0);
        // The invalid unit at ordinal 1 is never handed out.
        let next = store.next_dispatchable(job.id, 1).await.unwrap().unwrap();
        assert_eq!(next.ordinal, 2);
        assert!(store.next_dispatchable(job.id, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_transition_stamps_started_at() {
        let store = MemoryJobStore::new();
        let job = job();
        store.create_job(&job).await.unwrap();

        store
            .update_job_state(job.id, JobState::Running, None)
            .await
            .unwrap();
        let loaded = store.find_job(job.id).await.unwrap().unwrap();
        assert!(loaded.started_at.is_some());
        assert!(loaded.finished_at.is_none());

        store
            .update_job_state(job.id, JobState::Completed, None)
            .await
            .unwrap();
        let loaded = store.find_job(job.id).await.unwrap().unwrap();
        assert!(loaded.finished_at.is_some());
    }
}
