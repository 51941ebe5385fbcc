//! Unit processor - exactly one external mutation attempt per invocation
//!
//! The processor never sleeps and never retries; the dispatcher owns the
//! retry loop so the idempotency key `(job id, ordinal, attempt)` stays
//! visible to the caller. A per-attempt wall-clock timeout maps to a
//! transient failure instead of wedging a worker.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::job::{ImportJob, OperationMode};
use crate::domain::services::{RecordRequest, RecordResponse, RecordService, RecordServiceError};
use crate::domain::unit::{FailureKind, ImportUnit};

/// Context for one attempt. `resume` is true when the unit was already in
/// `processing` at run start, which turns a `conflict` response into
/// success (the prior attempt's mutation landed before the crash).
#[derive(Debug, Clone, Copy)]
pub struct AttemptContext {
    pub attempt: u32,
    pub resume: bool,
}

/// Terminal outcome of a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded { record_id: Option<String> },
    Skipped { reason: String },
    Failed { kind: FailureKind, detail: String },
}

/// Executes one validated unit against the record service
pub struct UnitProcessor {
    service: Arc<dyn RecordService>,
    unit_timeout: Duration,
}

impl UnitProcessor {
    pub fn new(service: Arc<dyn RecordService>, unit_timeout: Duration) -> Self {
        Self {
            service,
            unit_timeout,
        }
    }

    /// One create/update/upsert/delete attempt for one unit.
    pub async fn process(
        &self,
        job: &ImportJob,
        unit: &ImportUnit,
        ctx: AttemptContext,
    ) -> AttemptOutcome {
        let Some(payload) = unit.normalized.clone() else {
            return AttemptOutcome::Failed {
                kind: FailureKind::Permanent,
                detail: "unit has no normalized payload".to_string(),
            };
        };

        let request = RecordRequest {
            job_id: job.id,
            ordinal: unit.ordinal,
            mode: job.config.mode,
            payload,
            fingerprint: unit.fingerprint.clone().unwrap_or_default(),
            idempotency_key: RecordRequest::idempotency_key(job.id, unit.ordinal),
        };

        debug!(
            job_id = %job.id,
            ordinal = unit.ordinal,
            attempt = ctx.attempt,
            resume = ctx.resume,
            "submitting unit to record service"
        );

        let result = tokio::time::timeout(self.unit_timeout, self.service.submit(&request)).await;

        match result {
            Err(_) => AttemptOutcome::Failed {
                kind: FailureKind::Transient,
                detail: format!("attempt timed out after {}ms", self.unit_timeout.as_millis()),
            },
            Ok(Ok(response)) => Self::map_response(job, response),
            Ok(Err(error)) => Self::map_error(job, unit, ctx, error),
        }
    }

    fn map_response(job: &ImportJob, response: RecordResponse) -> AttemptOutcome {
        match response {
            RecordResponse::Created { record_id } | RecordResponse::Updated { record_id } => {
                AttemptOutcome::Succeeded {
                    record_id: Some(record_id),
                }
            }
            RecordResponse::Unchanged { record_id } => {
                if job.config.skip_unchanged {
                    AttemptOutcome::Skipped {
                        reason: "content unchanged".to_string(),
                    }
                } else {
                    AttemptOutcome::Succeeded {
                        record_id: Some(record_id),
                    }
                }
            }
            RecordResponse::Deleted => AttemptOutcome::Succeeded { record_id: None },
            RecordResponse::Missing => {
                if job.config.mode == OperationMode::Delete {
                    AttemptOutcome::Skipped {
                        reason: "record not found, nothing to delete".to_string(),
                    }
                } else {
                    AttemptOutcome::Failed {
                        kind: FailureKind::Permanent,
                        detail: "record service reported a missing record".to_string(),
                    }
                }
            }
        }
    }

    fn map_error(
        job: &ImportJob,
        unit: &ImportUnit,
        ctx: AttemptContext,
        error: RecordServiceError,
    ) -> AttemptOutcome {
        match error {
            RecordServiceError::Conflict { existing_id } => {
                if ctx.resume {
                    // The crashed attempt's mutation already landed
                    warn!(
                        job_id = %job.id,
                        ordinal = unit.ordinal,
                        "conflict on resumed attempt reconciled to success"
                    );
                    AttemptOutcome::Succeeded {
                        record_id: existing_id,
                    }
                } else {
                    AttemptOutcome::Failed {
                        kind: FailureKind::Conflict,
                        detail: match existing_id {
                            Some(id) => format!("record already exists ({id})"),
                            None => "record already exists".to_string(),
                        },
                    }
                }
            }
            RecordServiceError::Rejected { errors } => AttemptOutcome::Failed {
                kind: FailureKind::ValidationRejectedDownstream,
                detail: errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            },
            RecordServiceError::Transient { detail } => AttemptOutcome::Failed {
                kind: FailureKind::Transient,
                detail,
            },
            RecordServiceError::Permanent { detail } => AttemptOutcome::Failed {
                kind: FailureKind::Permanent,
                detail,
            },
        }
    }
}
