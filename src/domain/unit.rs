//! Import unit entity - one logical entry of a job's source file
//!
//! Units transition forward only: `pending -> validating -> validated |
//! invalid -> processing -> succeeded | failed | skipped`. The single
//! exception is the explicit retry-failed reset (`failed -> pending`) which
//! clears the failure detail and the attempt counter. The pair
//! `(job id, ordinal)` is the idempotency key used to avoid double
//! processing across retries and resumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::import_engine::parser::SourcePosition;
use crate::import_engine::validator::ValidationError;

/// Lifecycle state of one unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Validating,
    Validated,
    /// Failed declarative validation; never dispatched
    Invalid,
    Processing,
    Succeeded,
    Failed,
    Skipped,
}

impl UnitState {
    /// No further automatic transition occurs from these states. Invalid
    /// units never dispatch, so aggregation treats them as terminal too.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Invalid
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Validated => "validated",
            Self::Invalid => "invalid",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "validating" => Ok(Self::Validating),
            "validated" => Ok(Self::Validated),
            "invalid" => Ok(Self::Invalid),
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("Invalid UnitState: {other}")),
        }
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a processing failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Record already exists for this unit
    Conflict,
    /// The record service rejected the payload
    ValidationRejectedDownstream,
    /// Timeout, connect error or 5xx - eligible for retry
    Transient,
    Permanent,
    /// A transient error that exceeded the retry bound
    TransientExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::ValidationRejectedDownstream => "validation-rejected-downstream",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::TransientExhausted => "transient-exhausted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "conflict" => Ok(Self::Conflict),
            "validation-rejected-downstream" => Ok(Self::ValidationRejectedDownstream),
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            "transient-exhausted" => Ok(Self::TransientExhausted),
            other => Err(format!("Invalid FailureKind: {other}")),
        }
    }
}

/// Processing error detail recorded on a failed unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitFailure {
    pub kind: FailureKind,
    pub detail: String,
}

/// Terminal outcome written through the job store's atomic
/// mark-terminal-and-increment operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum UnitOutcome {
    Succeeded { record_id: Option<String> },
    Skipped { reason: String },
    Failed { failure: UnitFailure },
}

impl UnitOutcome {
    pub fn state(&self) -> UnitState {
        match self {
            Self::Succeeded { .. } => UnitState::Succeeded,
            Self::Skipped { .. } => UnitState::Skipped,
            Self::Failed { .. } => UnitState::Failed,
        }
    }
}

/// One row/entry of the source file, scoped to exactly one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportUnit {
    pub job_id: Uuid,
    /// Stable index within the file, part of the idempotency key
    pub ordinal: u64,
    pub state: UnitState,
    pub raw: Map<String, Value>,
    pub normalized: Option<Map<String, Value>>,
    /// Content hash of the normalized payload, used for upsert no-op detection
    pub fingerprint: Option<String>,
    /// Weak reference to the catalog record this unit produced
    pub record_id: Option<String>,
    pub errors: Vec<ValidationError>,
    pub failure: Option<UnitFailure>,
    pub attempts: u32,
    pub position: SourcePosition,
    pub updated_at: DateTime<Utc>,
}

impl ImportUnit {
    pub fn pending(job_id: Uuid, ordinal: u64, raw: Map<String, Value>, position: SourcePosition) -> Self {
        Self {
            job_id,
            ordinal,
            state: UnitState::Pending,
            raw,
            normalized: None,
            fingerprint: None,
            record_id: None,
            errors: Vec::new(),
            failure: None,
            attempts: 0,
            position,
            updated_at: Utc::now(),
        }
    }

    /// A unit is dispatchable once validated. A pending unit with a
    /// normalized payload was reset by retry-failed and dispatches again.
    pub fn is_dispatchable(&self) -> bool {
        match self.state {
            UnitState::Validated => true,
            UnitState::Pending => self.normalized.is_some(),
            _ => false,
        }
    }
}
