//! Dispatcher - bounded worker pool over dispatchable units
//!
//! Pulls units in ordinal order, runs them through the unit processor under
//! a semaphore-bounded pool, and owns the transient-retry loop with
//! exponential backoff. Pause and cancel are cooperative: both are observed
//! before a new unit starts, in-flight units always run to completion.
//! Exactly one durable mark-terminal write happens per unit per run.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::event::EventBus;
use crate::domain::job::{ImportJob, RetryPolicy};
use crate::domain::repositories::JobStore;
use crate::domain::unit::{FailureKind, ImportUnit, UnitFailure, UnitOutcome, UnitState};
use crate::import_engine::processor::{AttemptContext, AttemptOutcome, UnitProcessor};
use crate::import_engine::progress::JobProgress;

/// Cooperative control signal for a live run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    Pause,
    Cancel,
}

/// How a dispatch run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every dispatchable unit reached a terminal state
    Drained,
    /// Pause observed; remaining units untouched for a later resume
    Paused,
    /// Cancel observed; remaining units stay pending, counts frozen
    Cancelled,
    /// A unit failed with fail-fast enabled; no further units dispatched
    FailFast,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("job store failure during dispatch: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub worker_limit: usize,
    pub retry: RetryPolicy,
    pub fail_fast: bool,
}

/// Shared context moved into each worker task
struct WorkerContext {
    job: ImportJob,
    store: Arc<dyn JobStore>,
    processor: Arc<UnitProcessor>,
    progress: Arc<JobProgress>,
    events: EventBus,
    retry: RetryPolicy,
    fail_fast: bool,
    fail_fast_hit: AtomicBool,
    shutdown: CancellationToken,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    processor: Arc<UnitProcessor>,
    progress: Arc<JobProgress>,
    events: EventBus,
    config: DispatchConfig,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<UnitProcessor>,
        progress: Arc<JobProgress>,
        events: EventBus,
        config: DispatchConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            processor,
            progress,
            events,
            config,
            shutdown,
        }
    }

    /// Run dispatch for one job until drained, paused, cancelled or the
    /// fail-fast trigger fires.
    pub async fn run(
        &self,
        job: &ImportJob,
        mut control: watch::Receiver<RunSignal>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let worker_limit = self.config.worker_limit.max(1);
        let semaphore = Arc::new(Semaphore::new(worker_limit));
        let ctx = Arc::new(WorkerContext {
            job: job.clone(),
            store: Arc::clone(&self.store),
            processor: Arc::clone(&self.processor),
            progress: Arc::clone(&self.progress),
            events: self.events.clone(),
            retry: self.config.retry.clone(),
            fail_fast: self.config.fail_fast,
            fail_fast_hit: AtomicBool::new(false),
            shutdown: self.shutdown.clone(),
        });

        // Units left in `processing` by a crashed run dispatch first, with
        // the resume flag set so a downstream conflict reads as success.
        let mut stale: VecDeque<ImportUnit> = self
            .store
            .units_in_state(job.id, UnitState::Processing)
            .await?
            .into();
        if !stale.is_empty() {
            info!(
                job_id = %job.id,
                count = stale.len(),
                "re-dispatching units left in processing by a previous run"
            );
        }

        let mut join_set: JoinSet<u64> = JoinSet::new();
        let mut inflight: HashSet<u64> = HashSet::new();
        let mut cursor: u64 = 0;

        info!(job_id = %job.id, worker_limit, "🚀 dispatch run started");

        let mut outcome = loop {
            if self.shutdown.is_cancelled() {
                break DispatchOutcome::Paused;
            }
            match *control.borrow() {
                RunSignal::Pause => break DispatchOutcome::Paused,
                RunSignal::Cancel => break DispatchOutcome::Cancelled,
                RunSignal::Run => {}
            }
            if ctx.fail_fast_hit.load(Ordering::SeqCst) {
                break DispatchOutcome::FailFast;
            }

            // Wait for a worker slot while staying responsive to signals
            // and reaping finished workers.
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break DispatchOutcome::Paused,
                    }
                }
                _ = control.changed() => continue,
                _ = self.shutdown.cancelled() => continue,
                Some(joined) = join_set.join_next() => {
                    Self::reap(joined, &mut inflight);
                    continue;
                }
            };

            // Re-check signals after the permit wait: a worker that finished
            // while we were blocked may have tripped fail-fast, and a pause
            // or cancel must win over dispatching one more unit.
            match *control.borrow() {
                RunSignal::Pause => {
                    drop(permit);
                    break DispatchOutcome::Paused;
                }
                RunSignal::Cancel => {
                    drop(permit);
                    break DispatchOutcome::Cancelled;
                }
                RunSignal::Run => {}
            }
            if ctx.fail_fast_hit.load(Ordering::SeqCst) {
                drop(permit);
                break DispatchOutcome::FailFast;
            }

            let next = match stale.pop_front() {
                Some(unit) => Some((unit, true)),
                None => self
                    .store
                    .next_dispatchable(job.id, cursor)
                    .await?
                    .map(|unit| (unit, false)),
            };
            let Some((unit, resume)) = next else {
                drop(permit);
                break DispatchOutcome::Drained;
            };
            if !resume {
                cursor = unit.ordinal + 1;
            }

            debug!(job_id = %job.id, ordinal = unit.ordinal, resume, "dispatching unit");
            inflight.insert(unit.ordinal);
            let worker_ctx = Arc::clone(&ctx);
            let worker_control = control.clone();
            join_set.spawn(async move {
                let _permit = permit;
                process_unit(worker_ctx, unit, resume, worker_control).await
            });
        };

        // In-flight units always finish, whatever ended the pull loop.
        while let Some(joined) = join_set.join_next().await {
            Self::reap(joined, &mut inflight);
        }

        // Anything still tracked belongs to a panicked worker; record the
        // failure so the unit cannot wedge the job.
        for ordinal in inflight {
            error!(job_id = %job.id, ordinal, "worker crashed before reaching a terminal state");
            let failure = UnitOutcome::Failed {
                failure: UnitFailure {
                    kind: FailureKind::Permanent,
                    detail: "worker crashed while processing this unit".to_string(),
                },
            };
            if self
                .store
                .mark_unit_terminal(job.id, ordinal, &failure)
                .await
                .is_ok()
            {
                self.progress.record(UnitState::Failed);
                self.events.unit_finished(job.id, ordinal, UnitState::Failed);
            }
        }

        if outcome == DispatchOutcome::Drained && ctx.fail_fast_hit.load(Ordering::SeqCst) {
            outcome = DispatchOutcome::FailFast;
        }

        info!(job_id = %job.id, ?outcome, "dispatch run finished");
        Ok(outcome)
    }

    fn reap(joined: Result<u64, tokio::task::JoinError>, inflight: &mut HashSet<u64>) {
        match joined {
            Ok(ordinal) => {
                inflight.remove(&ordinal);
            }
            Err(join_error) => {
                // Ordinal stays in the in-flight set and is marked failed
                // after the drain.
                error!("worker task failed to join: {join_error}");
            }
        }
    }
}

/// One unit from first attempt to terminal write. Returns the ordinal so
/// the dispatcher can confirm the unit left the in-flight set.
async fn process_unit(
    ctx: Arc<WorkerContext>,
    unit: ImportUnit,
    resume: bool,
    mut control: watch::Receiver<RunSignal>,
) -> u64 {
    let job_id = ctx.job.id;
    let ordinal = unit.ordinal;
    let max_attempts = ctx.retry.max_attempts.max(1);
    let mut attempt = unit.attempts + 1;

    let terminal = loop {
        if let Err(e) = ctx.store.mark_unit_processing(job_id, ordinal, attempt).await {
            error!(job_id = %job_id, ordinal, "failed to mark unit processing: {e}");
            break AttemptOutcome::Failed {
                kind: FailureKind::Permanent,
                detail: format!("job store rejected the processing marker: {e}"),
            };
        }

        let outcome = ctx
            .processor
            .process(&ctx.job, &unit, AttemptContext { attempt, resume })
            .await;

        match outcome {
            AttemptOutcome::Failed {
                kind: FailureKind::Transient,
                detail,
            } if attempt < max_attempts => {
                let delay = ctx.retry.delay_for_attempt(attempt);
                warn!(
                    job_id = %job_id,
                    ordinal,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {detail}"
                );
                ctx.events
                    .unit_retrying(job_id, ordinal, attempt, delay.as_millis() as u64);

                let aborted = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = wait_for_cancel(&mut control) => true,
                    _ = ctx.shutdown.cancelled() => true,
                };
                if aborted {
                    break AttemptOutcome::Failed {
                        kind: FailureKind::Transient,
                        detail: format!("retry wait aborted by cancel: {detail}"),
                    };
                }
                attempt += 1;
            }
            AttemptOutcome::Failed {
                kind: FailureKind::Transient,
                detail,
            } => {
                break AttemptOutcome::Failed {
                    kind: FailureKind::TransientExhausted,
                    detail: format!("retry bound of {max_attempts} exhausted: {detail}"),
                };
            }
            other => break other,
        }
    };

    let outcome = match terminal {
        AttemptOutcome::Succeeded { record_id } => UnitOutcome::Succeeded { record_id },
        AttemptOutcome::Skipped { reason } => UnitOutcome::Skipped { reason },
        AttemptOutcome::Failed { kind, detail } => UnitOutcome::Failed {
            failure: UnitFailure { kind, detail },
        },
    };
    let state = outcome.state();

    match ctx.store.mark_unit_terminal(job_id, ordinal, &outcome).await {
        Ok(()) => {
            ctx.progress.record(state);
            ctx.events.unit_finished(job_id, ordinal, state);
            ctx.events.progress_updated(job_id, ctx.progress.snapshot());
            if state == UnitState::Failed && ctx.fail_fast {
                warn!(job_id = %job_id, ordinal, "fail-fast triggered");
                ctx.fail_fast_hit.store(true, Ordering::SeqCst);
            }
        }
        Err(e) => {
            error!(job_id = %job_id, ordinal, "failed to persist terminal unit state: {e}");
        }
    }

    ordinal
}

/// Resolves when the control channel reads `Cancel`. Sender loss counts as
/// cancel so a worker never sleeps past its run's lifetime.
async fn wait_for_cancel(control: &mut watch::Receiver<RunSignal>) {
    loop {
        if *control.borrow() == RunSignal::Cancel {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::{FileReference, JobConfig};
    use crate::domain::services::{
        RecordRequest, RecordResponse, RecordService, RecordServiceError,
    };
    use crate::import_engine::parser::SourcePosition;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::time::Duration;

    struct AlwaysCreated;

    #[async_trait]
    impl RecordService for AlwaysCreated {
        async fn submit(
            &self,
            request: &RecordRequest,
        ) -> Result<RecordResponse, RecordServiceError> {
            Ok(RecordResponse::Created {
                record_id: format!("rec-{}", request.ordinal),
            })
        }
    }

    async fn seeded_store(job: &ImportJob, total: u64) -> Arc<dyn JobStore> {
        let store = crate::infrastructure::memory_job_store::MemoryJobStore::new();
        store.create_job(job).await.unwrap();
        let units: Vec<ImportUnit> = (0..total)
            .map(|ordinal| {
                let mut unit =
                    ImportUnit::pending(job.id, ordinal, Map::new(), SourcePosition::default());
                unit.state = UnitState::Validated;
                unit.normalized = Some(Map::new());
                unit.fingerprint = Some("fp".to_string());
                unit
            })
            .collect();
        store.insert_units(&units).await.unwrap();
        store.set_job_total(job.id, total).await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn drains_all_units() {
        let job = ImportJob::new("t", FileReference::new("f"), JobConfig::default(), None);
        let store = seeded_store(&job, 5).await;
        let progress = Arc::new(JobProgress::new(5));
        let processor = Arc::new(UnitProcessor::new(
            Arc::new(AlwaysCreated),
            Duration::from_secs(5),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            processor,
            Arc::clone(&progress),
            EventBus::default(),
            DispatchConfig {
                worker_limit: 2,
                retry: RetryPolicy::default(),
                fail_fast: false,
            },
            CancellationToken::new(),
        );

        let (_tx, rx) = watch::channel(RunSignal::Run);
        let outcome = dispatcher.run(&job, rx).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Drained);
        assert!(progress.finalized());

        let counts = store.job_counts(job.id).await.unwrap();
        assert_eq!(counts.succeeded, 5);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn cancel_before_start_dispatches_nothing() {
        let job = ImportJob::new("t", FileReference::new("f"), JobConfig::default(), None);
        let store = seeded_store(&job, 4).await;
        let progress = Arc::new(JobProgress::new(4));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(UnitProcessor::new(
                Arc::new(AlwaysCreated),
                Duration::from_secs(5),
            )),
            Arc::clone(&progress),
            EventBus::default(),
            DispatchConfig {
                worker_limit: 2,
                retry: RetryPolicy::default(),
                fail_fast: false,
            },
            CancellationToken::new(),
        );

        let (tx, rx) = watch::channel(RunSignal::Cancel);
        let outcome = dispatcher.run(&job, rx).await.unwrap();
        drop(tx);
        assert_eq!(outcome, DispatchOutcome::Cancelled);
        let counts = store.job_counts(job.id).await.unwrap();
        assert_eq!(counts.terminal(), 0);
    }
}
