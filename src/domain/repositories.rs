//! Persistence contract for jobs and units
//!
//! The engine reads and writes all durable state through this trait. The
//! one operation with special semantics is `mark_unit_terminal`: it writes
//! the unit outcome AND increments the job's aggregate counters atomically,
//! so counters are never re-derived by scanning unit rows.

use async_trait::async_trait;
use anyhow::Result;
use uuid::Uuid;

use crate::domain::job::{ImportJob, JobConfig, JobState, UnitCounts};
use crate::domain::unit::{ImportUnit, UnitOutcome, UnitState};

#[async_trait]
pub trait JobStore: Send + Sync {
    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn create_job(&self, job: &ImportJob) -> Result<()>;

    async fn find_job(&self, job_id: Uuid) -> Result<Option<ImportJob>>;

    async fn list_jobs(&self) -> Result<Vec<ImportJob>>;

    /// Update the job state, stamping `started_at` on the first transition
    /// into `running` and `finished_at` on any terminal state.
    async fn update_job_state(
        &self,
        job_id: Uuid,
        state: JobState,
        warning: Option<String>,
    ) -> Result<()>;

    /// Replace the job configuration. Only legal while the job is `draft`;
    /// the service layer enforces that before calling.
    async fn update_job_config(&self, job_id: Uuid, config: &JobConfig) -> Result<()>;

    /// Record the total unit count once parsing finished. Immutable once set.
    async fn set_job_total(&self, job_id: Uuid, total: u64) -> Result<()>;

    // ------------------------------------------------------------------
    // Units
    // ------------------------------------------------------------------

    /// Batch insert during the validation phase. Invalid units in the batch
    /// increment the job's `failed` counter in the same write.
    async fn insert_units(&self, units: &[ImportUnit]) -> Result<()>;

    /// Durably flag a unit `processing` before the external mutation is
    /// attempted (crash-recovery marker), bumping its attempt counter.
    async fn mark_unit_processing(&self, job_id: Uuid, ordinal: u64, attempt: u32) -> Result<()>;

    /// Atomically write the terminal unit outcome and increment the job
    /// aggregate. Errors if the unit is already terminal (idempotency guard).
    async fn mark_unit_terminal(
        &self,
        job_id: Uuid,
        ordinal: u64,
        outcome: &UnitOutcome,
    ) -> Result<()>;

    /// Reset failed units to `pending`, clearing failure detail and attempt
    /// counters, and decrement the job's `failed` counter accordingly.
    /// Returns the number of units reset.
    async fn reset_failed_units(&self, job_id: Uuid) -> Result<u64>;

    /// First dispatchable unit with ordinal >= `from_ordinal`, in ordinal
    /// order. This is the resumption cursor query.
    async fn next_dispatchable(&self, job_id: Uuid, from_ordinal: u64) -> Result<Option<ImportUnit>>;

    async fn units_in_state(&self, job_id: Uuid, state: UnitState) -> Result<Vec<ImportUnit>>;

    async fn find_unit(&self, job_id: Uuid, ordinal: u64) -> Result<Option<ImportUnit>>;

    async fn list_units(&self, job_id: Uuid) -> Result<Vec<ImportUnit>>;

    async fn job_counts(&self, job_id: Uuid) -> Result<UnitCounts>;
}
