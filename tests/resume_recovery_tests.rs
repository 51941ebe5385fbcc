//! Pause, resume, cancel and crash-recovery behavior: only non-terminal
//! units re-dispatch, in-flight units always drain, and a stale
//! `processing` marker reconciles through the conflict path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bulk_importer::domain::job::{
    FileReference, ImportJob, JobConfig, JobState, RetryPolicy,
};
use bulk_importer::domain::repositories::JobStore;
use bulk_importer::domain::services::{
    RecordRequest, RecordResponse, RecordService, RecordServiceError, SourceStorage, StorageError,
};
use bulk_importer::domain::unit::{ImportUnit, UnitOutcome, UnitState};
use bulk_importer::import_engine::parser::SourcePosition;
use bulk_importer::infrastructure::{ImporterConfig, LocalSourceStorage, MemoryJobStore};
use bulk_importer::{ImporterError, ImporterService};
use serde_json::Map;
use tokio::sync::watch;
use uuid::Uuid;

fn test_config() -> ImporterConfig {
    let mut config = ImporterConfig::default();
    config.engine.worker_limit = 2;
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 5,
        max_delay_ms: 20,
        backoff_multiplier: 2.0,
        jitter_ms: 0,
    };
    config
}

fn validated_unit(job_id: Uuid, ordinal: u64) -> ImportUnit {
    let mut unit = ImportUnit::pending(job_id, ordinal, Map::new(), SourcePosition::default());
    unit.state = UnitState::Validated;
    unit.normalized = Some(Map::new());
    unit.fingerprint = Some(format!("fp-{ordinal}"));
    unit
}

/// Store pre-seeded past the validation phase: `total` validated units,
/// the first `succeeded` already terminal, job parked in `state`.
async fn seeded_store(
    job: &ImportJob,
    total: u64,
    succeeded: u64,
    state: JobState,
) -> Arc<MemoryJobStore> {
    let store = Arc::new(MemoryJobStore::new());
    store.create_job(job).await.unwrap();
    let units: Vec<ImportUnit> = (0..total).map(|o| validated_unit(job.id, o)).collect();
    store.insert_units(&units).await.unwrap();
    store.set_job_total(job.id, total).await.unwrap();
    for ordinal in 0..succeeded {
        store
            .mark_unit_terminal(
                job.id,
                ordinal,
                &UnitOutcome::Succeeded {
                    record_id: Some(format!("rec-{ordinal}")),
                },
            )
            .await
            .unwrap();
    }
    store.update_job_state(job.id, state, None).await.unwrap();
    store
}

async fn wait_for_state(service: &ImporterService, job_id: Uuid, state: JobState) -> ImportJob {
    for _ in 0..400 {
        let job = service.job_status(job_id).await.unwrap();
        if job.state == state {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached {state}");
}

/// Counts calls per ordinal; a scripted ordinal answers from its script.
struct CountingService {
    calls: Mutex<HashMap<u64, u32>>,
    scripted: Mutex<HashMap<u64, Result<RecordResponse, RecordServiceError>>>,
}

impl CountingService {
    fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
        }
    }

    fn calls_for(&self, ordinal: u64) -> u32 {
        self.calls.lock().unwrap().get(&ordinal).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RecordService for CountingService {
    async fn submit(
        &self,
        request: &RecordRequest,
    ) -> Result<RecordResponse, RecordServiceError> {
        *self.calls.lock().unwrap().entry(request.ordinal).or_insert(0) += 1;
        if let Some(outcome) = self.scripted.lock().unwrap().remove(&request.ordinal) {
            return outcome;
        }
        Ok(RecordResponse::Created {
            record_id: format!("rec-{}", request.ordinal),
        })
    }
}

/// Blocks every submission until the gate opens; counts started attempts.
struct GatedService {
    started: Arc<AtomicU64>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl RecordService for GatedService {
    async fn submit(
        &self,
        request: &RecordRequest,
    ) -> Result<RecordResponse, RecordServiceError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        Ok(RecordResponse::Created {
            record_id: format!("rec-{}", request.ordinal),
        })
    }
}

/// Holds the first `resolve` until the gate fires, so a test can observe
/// the job mid-validation.
struct GatedStorage {
    inner: LocalSourceStorage,
    gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl SourceStorage for GatedStorage {
    fn resolve(&self, reference: &FileReference) -> Result<std::fs::File, StorageError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.inner.resolve(reference)
    }
}

fn service_over(store: Arc<MemoryJobStore>, records: Arc<dyn RecordService>) -> ImporterService {
    let dir = std::env::temp_dir();
    ImporterService::new(store, records, Arc::new(LocalSourceStorage::new(dir)), test_config())
}

#[tokio::test]
async fn resume_skips_already_terminal_units() {
    let job = ImportJob::new("resume", FileReference::new("f.csv"), JobConfig::default(), None);
    let store = seeded_store(&job, 5, 2, JobState::Paused).await;
    let records = Arc::new(CountingService::new());
    let service = service_over(store, Arc::clone(&records) as Arc<dyn RecordService>);

    service.resume(job.id).await.unwrap();
    let finished = wait_for_state(&service, job.id, JobState::Completed).await;

    assert_eq!(finished.counts.succeeded, 5);
    // Units that already succeeded are never re-submitted.
    assert_eq!(records.calls_for(0), 0);
    assert_eq!(records.calls_for(1), 0);
    assert_eq!(records.calls_for(2), 1);
    assert_eq!(records.calls_for(4), 1);
}

#[tokio::test]
async fn recover_reconciles_stale_processing_via_conflict() {
    let job = ImportJob::new("crashed", FileReference::new("f.csv"), JobConfig::default(), None);
    let store = seeded_store(&job, 5, 2, JobState::Running).await;
    // Unit 2 was mid-flight when the previous process died.
    store.mark_unit_processing(job.id, 2, 1).await.unwrap();

    let records = Arc::new(CountingService::new());
    // The crashed attempt's create landed downstream, so the replay conflicts.
    records.scripted.lock().unwrap().insert(
        2,
        Err(RecordServiceError::Conflict {
            existing_id: Some("rec-existing".to_string()),
        }),
    );
    let service = service_over(store, Arc::clone(&records) as Arc<dyn RecordService>);

    service.recover().await.unwrap();
    let finished = wait_for_state(&service, job.id, JobState::Completed).await;

    assert_eq!(finished.counts.succeeded, 5);
    let unit = service.find_unit(job.id, 2).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::Succeeded);
    assert_eq!(unit.record_id.as_deref(), Some("rec-existing"));
}

#[tokio::test]
async fn recover_fails_jobs_interrupted_during_validation() {
    let store = Arc::new(MemoryJobStore::new());
    let mut job =
        ImportJob::new("mid-validate", FileReference::new("f.csv"), JobConfig::default(), None);
    job.state = JobState::Validating;
    store.create_job(&job).await.unwrap();

    let service = service_over(store, Arc::new(CountingService::new()));
    service.recover().await.unwrap();

    let job = service.job_status(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.warning.is_some());
}

#[tokio::test]
async fn cancel_drains_inflight_and_freezes_the_rest() {
    let job = ImportJob::new("cancel", FileReference::new("f.csv"), JobConfig::default(), None);
    let store = seeded_store(&job, 5, 0, JobState::Ready).await;

    let started = Arc::new(AtomicU64::new(0));
    let (gate_tx, gate_rx) = watch::channel(false);
    let records = Arc::new(GatedService {
        started: Arc::clone(&started),
        gate: gate_rx,
    });
    let service = service_over(Arc::clone(&store), records);

    service.start(job.id).await.unwrap();

    // Both workers are mid-unit before the cancel arrives.
    for _ in 0..400 {
        if started.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(started.load(Ordering::SeqCst), 2);

    service.cancel(job.id).await.unwrap();
    gate_tx.send(true).unwrap();
    let finished = wait_for_state(&service, job.id, JobState::Cancelled).await;

    // The two in-flight units drained to success, nothing else started.
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(finished.counts.succeeded, 2);
    let remaining = store
        .units_in_state(job.id, UnitState::Validated)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 3);

    // A cancelled job cannot come back.
    assert!(matches!(
        service.resume(job.id).await,
        Err(ImporterError::Conflict(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_validation_stays_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("products.csv"), "sku,name\nA,Alpha\nB,Beta\n").unwrap();

    let (gate_tx, gate_rx) = std::sync::mpsc::channel();
    let storage = Arc::new(GatedStorage {
        inner: LocalSourceStorage::new(dir.path().to_path_buf()),
        gate: Mutex::new(Some(gate_rx)),
    });
    let store = Arc::new(MemoryJobStore::new());
    let records = Arc::new(CountingService::new());
    let service = ImporterService::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::clone(&records) as Arc<dyn RecordService>,
        storage,
        test_config(),
    );

    let job = service
        .create_job(
            "cancel-mid-validate",
            FileReference::new("products.csv"),
            JobConfig::default(),
            None,
        )
        .await
        .unwrap();

    let starter = {
        let service = service.clone();
        let job_id = job.id;
        tokio::spawn(async move { service.start(job_id).await })
    };
    wait_for_state(&service, job.id, JobState::Validating).await;

    service.cancel(job.id).await.unwrap();
    assert_eq!(
        service.job_status(job.id).await.unwrap().state,
        JobState::Cancelled
    );

    // Validation finishes after the cancel; the terminal state must win
    // and nothing may dispatch.
    gate_tx.send(()).unwrap();
    starter.await.unwrap().unwrap();

    assert_eq!(
        service.job_status(job.id).await.unwrap().state,
        JobState::Cancelled
    );
    for ordinal in 0..2 {
        assert_eq!(records.calls_for(ordinal), 0);
    }
}

#[tokio::test]
async fn cancel_while_ready_stays_undispatched() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("products.csv"), "sku,name\nA,Alpha\nB,Beta\n").unwrap();

    let store = Arc::new(MemoryJobStore::new());
    let records = Arc::new(CountingService::new());
    let service = ImporterService::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::clone(&records) as Arc<dyn RecordService>,
        Arc::new(LocalSourceStorage::new(dir.path().to_path_buf())),
        test_config(),
    );

    let mut config = JobConfig::default();
    config.auto_dispatch = false;
    let job = service
        .create_job("parked-ready", FileReference::new("products.csv"), config, None)
        .await
        .unwrap();

    service.start(job.id).await.unwrap();
    assert_eq!(
        service.job_status(job.id).await.unwrap().state,
        JobState::Ready
    );

    service.cancel(job.id).await.unwrap();
    assert_eq!(
        service.job_status(job.id).await.unwrap().state,
        JobState::Cancelled
    );

    assert!(matches!(
        service.start(job.id).await,
        Err(ImporterError::Conflict(_))
    ));
    for ordinal in 0..2 {
        assert_eq!(records.calls_for(ordinal), 0);
    }
}

#[tokio::test]
async fn pause_parks_and_resume_finishes() {
    let job = ImportJob::new("pause", FileReference::new("f.csv"), JobConfig::default(), None);
    let store = seeded_store(&job, 4, 0, JobState::Ready).await;

    let started = Arc::new(AtomicU64::new(0));
    let (gate_tx, gate_rx) = watch::channel(false);
    let records = Arc::new(GatedService {
        started: Arc::clone(&started),
        gate: gate_rx,
    });
    let service = service_over(Arc::clone(&store), records);

    service.start(job.id).await.unwrap();
    for _ in 0..400 {
        if started.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    service.pause(job.id).await.unwrap();
    gate_tx.send(true).unwrap();
    let parked = wait_for_state(&service, job.id, JobState::Paused).await;
    assert_eq!(parked.counts.succeeded, 2);
    assert_eq!(parked.counts.pending(), 2);

    // Resume picks up the untouched units; the gate is already open.
    service.resume(job.id).await.unwrap();
    let finished = wait_for_state(&service, job.id, JobState::Completed).await;
    assert_eq!(finished.counts.succeeded, 4);
    assert_eq!(started.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn shutdown_parks_running_jobs_for_later_recovery() {
    let job = ImportJob::new("shutdown", FileReference::new("f.csv"), JobConfig::default(), None);
    let store = seeded_store(&job, 3, 0, JobState::Ready).await;

    let started = Arc::new(AtomicU64::new(0));
    let (gate_tx, gate_rx) = watch::channel(false);
    let records = Arc::new(GatedService {
        started: Arc::clone(&started),
        gate: gate_rx.clone(),
    });
    let service = service_over(Arc::clone(&store), records);

    service.start(job.id).await.unwrap();
    for _ in 0..400 {
        if started.load(Ordering::SeqCst) >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = gate_tx.send(true);
    });
    service.shutdown().await;
    releaser.await.unwrap();

    let parked = store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(parked.state, JobState::Paused);
    assert!(parked.counts.terminal() < 3);

    // A fresh service over the same store finishes the job.
    let records = Arc::new(GatedService {
        started: Arc::clone(&started),
        gate: gate_rx,
    });
    let service = service_over(Arc::clone(&store), records);
    service.resume(job.id).await.unwrap();
    let finished = wait_for_state(&service, job.id, JobState::Completed).await;
    assert_eq!(finished.counts.succeeded, 3);
}
