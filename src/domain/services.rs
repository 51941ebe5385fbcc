//! Collaborator contracts: record-management service and source storage
//!
//! The engine treats the record service as an at-least-once-callable remote
//! operation. Every request carries the idempotency key so replays are
//! detectable downstream; a `Conflict` on a resumed attempt is reconciled
//! to success by the unit processor, not here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::job::{FileReference, OperationMode};
use crate::import_engine::validator::ValidationError;

/// One mutation request against the external record service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRequest {
    pub job_id: Uuid,
    pub ordinal: u64,
    pub mode: OperationMode,
    pub payload: Map<String, Value>,
    /// Content hash of the payload, used for unchanged-upsert detection
    pub fingerprint: String,
    /// `{job_id}:{ordinal}` - lets the service deduplicate replays
    pub idempotency_key: String,
}

impl RecordRequest {
    pub fn idempotency_key(job_id: Uuid, ordinal: u64) -> String {
        format!("{job_id}:{ordinal}")
    }
}

/// Successful response classifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordResponse {
    Created { record_id: String },
    Updated { record_id: String },
    /// Upsert found identical content; no mutation happened
    Unchanged { record_id: String },
    Deleted,
    /// Delete targeted a record that does not exist
    Missing,
}

/// Error classifications returned by the record service
#[derive(Debug, Clone, Error)]
pub enum RecordServiceError {
    #[error("record already exists{}", existing_id.as_deref().map(|id| format!(" ({id})")).unwrap_or_default())]
    Conflict { existing_id: Option<String> },

    #[error("payload rejected by record service: {}", errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; "))]
    Rejected { errors: Vec<ValidationError> },

    #[error("transient record service failure: {detail}")]
    Transient { detail: String },

    #[error("permanent record service failure: {detail}")]
    Permanent { detail: String },
}

/// Accepts one (operation mode, normalized payload) mutation attempt
#[async_trait]
pub trait RecordService: Send + Sync {
    async fn submit(&self, request: &RecordRequest) -> Result<RecordResponse, RecordServiceError>;
}

/// Resolving a stored file reference to a readable byte stream
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("source file not found: {reference}")]
    NotFound { reference: String },

    #[error("reference escapes the storage root: {reference}")]
    OutsideRoot { reference: String },

    #[error("storage I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Resolves an opaque file reference to an open, seekable file. Upload,
/// retention and credentials live outside this engine.
pub trait SourceStorage: Send + Sync {
    fn resolve(&self, reference: &FileReference) -> Result<std::fs::File, StorageError>;
}
