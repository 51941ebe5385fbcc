//! Import events broadcast to observers (API layer, progress reporting)
//!
//! Emission is best-effort: lagging receivers drop events, the engine never
//! blocks on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::job::{JobState, UnitCounts};
use crate::domain::unit::UnitState;
use crate::import_engine::progress::ProgressSnapshot;

/// Events emitted while a job moves through its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImportEvent {
    JobStateChanged {
        job_id: Uuid,
        from: JobState,
        to: JobState,
        timestamp: DateTime<Utc>,
    },
    UnitFinished {
        job_id: Uuid,
        ordinal: u64,
        state: UnitState,
        timestamp: DateTime<Utc>,
    },
    UnitRetrying {
        job_id: Uuid,
        ordinal: u64,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ProgressUpdated {
        job_id: Uuid,
        snapshot: ProgressSnapshot,
        timestamp: DateTime<Utc>,
    },
    JobFinished {
        job_id: Uuid,
        state: JobState,
        counts: UnitCounts,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for import events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ImportEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.sender.subscribe()
    }

    /// Send to whoever is listening; a bus with no receivers is fine.
    pub fn emit(&self, event: ImportEvent) {
        let _ = self.sender.send(event);
    }

    pub fn job_state_changed(&self, job_id: Uuid, from: JobState, to: JobState) {
        self.emit(ImportEvent::JobStateChanged {
            job_id,
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    pub fn unit_finished(&self, job_id: Uuid, ordinal: u64, state: UnitState) {
        self.emit(ImportEvent::UnitFinished {
            job_id,
            ordinal,
            state,
            timestamp: Utc::now(),
        });
    }

    pub fn unit_retrying(&self, job_id: Uuid, ordinal: u64, attempt: u32, delay_ms: u64) {
        self.emit(ImportEvent::UnitRetrying {
            job_id,
            ordinal,
            attempt,
            delay_ms,
            timestamp: Utc::now(),
        });
    }

    pub fn progress_updated(&self, job_id: Uuid, snapshot: ProgressSnapshot) {
        self.emit(ImportEvent::ProgressUpdated {
            job_id,
            snapshot,
            timestamp: Utc::now(),
        });
    }

    pub fn job_finished(&self, job_id: Uuid, state: JobState, counts: UnitCounts) {
        self.emit(ImportEvent::JobFinished {
            job_id,
            state,
            counts,
            timestamp: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
