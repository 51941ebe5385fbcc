//! HTTP client for the downstream record service
//!
//! Each unit becomes exactly one request, routed by the job's operation
//! mode. The idempotency key rides along as a header so the service can
//! deduplicate re-submissions after a crash. Status codes map onto the
//! engine's failure taxonomy: 409 is a conflict, 422 a downstream
//! validation rejection, 408/429/5xx and transport errors are transient,
//! any other 4xx is permanent.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::domain::job::OperationMode;
use crate::domain::services::{
    RecordRequest, RecordResponse, RecordService, RecordServiceError,
};
use crate::import_engine::validator::ValidationError;
use crate::infrastructure::config::RecordServiceSettings;

#[derive(Debug, Deserialize)]
struct RecordBody {
    record_id: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    existing_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RejectionBody {
    #[serde(default)]
    errors: Vec<ValidationError>,
}

pub struct HttpRecordService {
    client: Client,
    base_url: Url,
}

impl HttpRecordService {
    pub fn new(settings: &RecordServiceSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;
        let base_url = Url::parse(&settings.base_url)?;
        Ok(Self { client, base_url })
    }

    fn record_url(&self, key: Option<&str>) -> Result<Url, RecordServiceError> {
        let path = match key {
            Some(key) => format!("records/{key}"),
            None => "records".to_string(),
        };
        self.base_url
            .join(&path)
            .map_err(|e| RecordServiceError::Permanent {
                detail: format!("cannot build record url: {e}"),
            })
    }

    async fn read_success(
        mode: OperationMode,
        response: Response,
    ) -> Result<RecordResponse, RecordServiceError> {
        if mode == OperationMode::Delete {
            return Ok(RecordResponse::Deleted);
        }
        let body: RecordBody = response.json().await.map_err(|e| {
            RecordServiceError::Transient {
                detail: format!("unreadable record service response: {e}"),
            }
        })?;
        let record_id = body.record_id.unwrap_or_default();
        match body.status.as_deref() {
            Some("updated") => Ok(RecordResponse::Updated { record_id }),
            Some("unchanged") => Ok(RecordResponse::Unchanged { record_id }),
            // Create responses usually omit the status field.
            _ => Ok(RecordResponse::Created { record_id }),
        }
    }
}

#[async_trait]
impl RecordService for HttpRecordService {
    async fn submit(
        &self,
        request: &RecordRequest,
    ) -> Result<RecordResponse, RecordServiceError> {
        let builder = match request.mode {
            OperationMode::Create => self.client.post(self.record_url(None)?),
            // Update never creates; a missing record is reported, not upserted.
            OperationMode::Update => self
                .client
                .patch(self.record_url(Some(&request.idempotency_key))?),
            OperationMode::Upsert => self
                .client
                .put(self.record_url(Some(&request.idempotency_key))?),
            OperationMode::Delete => self
                .client
                .delete(self.record_url(Some(&request.idempotency_key))?),
        };

        let mut builder = builder
            .header("Idempotency-Key", &request.idempotency_key)
            .header("X-Content-Fingerprint", &request.fingerprint);
        if request.mode != OperationMode::Delete {
            builder = builder.json(&request.payload);
        }

        debug!(
            job_id = %request.job_id,
            ordinal = request.ordinal,
            mode = ?request.mode,
            "submitting unit to record service"
        );

        let response = builder.send().await.map_err(|e| {
            let detail = format!("record service request failed: {e}");
            if e.is_timeout() || e.is_connect() {
                RecordServiceError::Transient { detail }
            } else {
                RecordServiceError::Permanent { detail }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Self::read_success(request.mode, response).await;
        }

        match status {
            StatusCode::NOT_FOUND
                if matches!(
                    request.mode,
                    OperationMode::Update | OperationMode::Delete
                ) =>
            {
                Ok(RecordResponse::Missing)
            }
            StatusCode::CONFLICT => {
                let body: ConflictBody = response.json().await.unwrap_or(ConflictBody {
                    existing_id: None,
                });
                Err(RecordServiceError::Conflict {
                    existing_id: body.existing_id,
                })
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body: RejectionBody = response
                    .json()
                    .await
                    .unwrap_or(RejectionBody { errors: Vec::new() });
                Err(RecordServiceError::Rejected { errors: body.errors })
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Err(RecordServiceError::Transient {
                    detail: format!("record service returned {status}"),
                })
            }
            status if status.is_server_error() => Err(RecordServiceError::Transient {
                detail: format!("record service returned {status}"),
            }),
            status => Err(RecordServiceError::Permanent {
                detail: format!("record service returned {status}"),
            }),
        }
    }
}
