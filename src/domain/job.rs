//! Import job entity and per-job configuration
//!
//! A job is one bulk-import run over one source file. Its state is governed
//! by the state machine in `import_engine::state_machine`; its aggregate
//! counters are only ever bumped through the job store's atomic
//! mark-terminal operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::import_engine::validator::{CrossFieldRule, FieldRule, UnknownFieldPolicy};

/// Lifecycle state of an import job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Source file registered, nothing parsed yet
    Draft,
    /// Parsing and validation in progress
    Validating,
    /// All units validated, none dispatched
    Ready,
    /// Dispatch in progress
    Running,
    /// Dispatch suspended, resumable
    Paused,
    /// All units succeeded or skipped
    Completed,
    /// Run finished with at least one failed unit
    CompletedWithErrors,
    /// Operator aborted, not resumable
    Cancelled,
    /// Unrecoverable error (malformed source, fail-fast trigger)
    Failed,
}

impl JobState {
    /// Terminal states accept no further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Cancelled | Self::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Validating => "validating",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "draft" => Ok(Self::Draft),
            "validating" => Ok(Self::Validating),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "completed_with_errors" => Ok(Self::CompletedWithErrors),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Invalid JobState: {other}")),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the job does with each unit against the record service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Create,
    /// Mutates an existing record; the record must already exist
    Update,
    Upsert,
    Delete,
}

/// Declared format of the source file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Delimited text with a header row
    Csv { delimiter: u8 },
    /// One JSON object per line
    JsonLines,
}

impl Default for SourceFormat {
    fn default() -> Self {
        Self::Csv { delimiter: b',' }
    }
}

/// Opaque handle to an already-stored source file, resolved by the
/// storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileReference(pub String);

impl FileReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Renames a source column to a target catalog field before validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

/// Bounded retry with exponential backoff for transient unit failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff for the attempt that just failed (1-based), jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = (exponential as u64).min(self.max_delay_ms);
        let jitter = if self.jitter_ms > 0 {
            fastrand::u64(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_ms: 200,
        }
    }
}

/// Per-job configuration: operation mode, source format, mapping and
/// validation rules, plus dispatch knobs that override engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub mode: OperationMode,
    pub format: SourceFormat,
    /// Source column -> target field renames applied before validation
    #[serde(default)]
    pub mapping: Vec<ColumnMapping>,
    /// Default values filled in for absent fields before rule evaluation
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub rules: Vec<FieldRule>,
    #[serde(default)]
    pub cross_rules: Vec<CrossFieldRule>,
    pub unknown_fields: UnknownFieldPolicy,
    /// Allow the job to reach `ready` with invalid units (skipped at dispatch)
    #[serde(default)]
    pub allow_partial: bool,
    /// First failed unit halts further dispatch
    #[serde(default)]
    pub fail_fast: bool,
    /// Upsert of unchanged content counts as skipped instead of succeeded
    #[serde(default)]
    pub skip_unchanged: bool,
    pub worker_limit: Option<usize>,
    pub retry: Option<RetryPolicy>,
    /// Proceed straight from `ready` into dispatch on start
    #[serde(default = "default_auto_dispatch")]
    pub auto_dispatch: bool,
}

fn default_auto_dispatch() -> bool {
    true
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Create,
            format: SourceFormat::default(),
            mapping: Vec::new(),
            defaults: Map::new(),
            rules: Vec::new(),
            cross_rules: Vec::new(),
            unknown_fields: UnknownFieldPolicy::Ignore,
            allow_partial: false,
            fail_fast: false,
            skip_unchanged: false,
            worker_limit: None,
            retry: None,
            auto_dispatch: true,
        }
    }
}

/// Aggregate unit counters for one job. Invalid units count as `failed`
/// because they never dispatch and a partial run reports them as failures.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitCounts {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl UnitCounts {
    pub fn terminal(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }

    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.terminal())
    }

    pub fn all_terminal(&self) -> bool {
        self.terminal() == self.total
    }
}

/// One bulk-import run over one source file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub title: String,
    pub source: FileReference,
    pub config: JobConfig,
    pub state: JobState,
    pub counts: UnitCounts,
    /// Set when the job reached `ready` with invalid units under a partial run
    pub warning: Option<String>,
    pub started_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn new(
        title: impl Into<String>,
        source: FileReference,
        config: JobConfig,
        started_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            source,
            config,
            state: JobState::Draft,
            counts: UnitCounts::default(),
            warning: None,
            started_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_in_draft() {
        let job = ImportJob::new(
            "products",
            FileReference::new("exports/products.csv"),
            JobConfig::default(),
            Some("operator@example.org".to_string()),
        );
        assert_eq!(job.state, JobState::Draft);
        assert_eq!(job.counts, UnitCounts::default());
        assert!(job.started_at.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::CompletedWithErrors.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn state_round_trips_through_text() {
        for state in [
            JobState::Draft,
            JobState::Validating,
            JobState::Ready,
            JobState::Running,
            JobState::Paused,
            JobState::Completed,
            JobState::CompletedWithErrors,
            JobState::Cancelled,
            JobState::Failed,
        ] {
            assert_eq!(JobState::parse(state.as_str()).unwrap(), state);
        }
        assert!(JobState::parse("bogus").is_err());
    }

    #[test]
    fn counts_arithmetic() {
        let counts = UnitCounts {
            total: 10,
            succeeded: 4,
            failed: 2,
            skipped: 1,
        };
        assert_eq!(counts.terminal(), 7);
        assert_eq!(counts.pending(), 3);
        assert!(!counts.all_terminal());
    }

    #[test]
    fn retry_delay_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 10.0,
            jitter_ms: 0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1_000));
    }
}
