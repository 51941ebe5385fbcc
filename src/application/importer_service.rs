//! Importer service - command interface and live-run registry
//!
//! One instance owns the live runs of this process: a registry of
//! `watch`-channel control handles keyed by job id. Commands validate
//! against the job state machine first, so a conflicting command never
//! touches a run. Durable state changes go through the job store; the
//! in-memory progress registry is a read-fast mirror of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::command::JobCommand;
use crate::domain::event::{EventBus, ImportEvent};
use crate::domain::job::{FileReference, ImportJob, JobConfig, JobState};
use crate::domain::repositories::JobStore;
use crate::domain::services::{RecordService, SourceStorage, StorageError};
use crate::domain::unit::{ImportUnit, UnitState};
use crate::import_engine::dispatcher::{
    DispatchConfig, DispatchOutcome, Dispatcher, RunSignal,
};
use crate::import_engine::parser::{ParseError, RawUnit, UnitParser};
use crate::import_engine::processor::UnitProcessor;
use crate::import_engine::progress::{ProgressRegistry, ProgressSnapshot};
use crate::import_engine::state_machine::{CommandConflict, JobStateMachine};
use crate::import_engine::validator::{UnitValidator, ValidatorBuildError};
use crate::infrastructure::config::ImporterConfig;

#[derive(Debug, Error)]
pub enum ImporterError {
    #[error("job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    #[error(transparent)]
    Conflict(#[from] CommandConflict),

    #[error("configuration can only change while a job is draft (state: {state})")]
    ConfigLocked { state: JobState },

    #[error(transparent)]
    Source(#[from] ParseError),

    #[error(transparent)]
    InvalidRules(#[from] ValidatorBuildError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("job store failure: {0}")]
    Store(#[from] anyhow::Error),
}

struct JobHandle {
    control: watch::Sender<RunSignal>,
    done: JoinHandle<()>,
}

/// Facade over the bulk import engine
#[derive(Clone)]
pub struct ImporterService {
    store: Arc<dyn JobStore>,
    records: Arc<dyn RecordService>,
    storage: Arc<dyn SourceStorage>,
    config: ImporterConfig,
    events: EventBus,
    progress: Arc<ProgressRegistry>,
    runs: Arc<RwLock<HashMap<Uuid, JobHandle>>>,
    shutdown: CancellationToken,
}

impl ImporterService {
    pub fn new(
        store: Arc<dyn JobStore>,
        records: Arc<dyn RecordService>,
        storage: Arc<dyn SourceStorage>,
        config: ImporterConfig,
    ) -> Self {
        Self {
            store,
            records,
            storage,
            config,
            events: EventBus::default(),
            progress: Arc::new(ProgressRegistry::new()),
            runs: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Event subscription as a stream, for API layers that forward events.
    pub fn event_stream(&self) -> BroadcastStream<ImportEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    // ------------------------------------------------------------------
    // Job creation and configuration
    // ------------------------------------------------------------------

    /// Register a new import job over an already-stored source file.
    /// The configuration is compiled up front so a bad rule set fails here,
    /// not at start time.
    pub async fn create_job(
        &self,
        title: impl Into<String>,
        source: FileReference,
        config: JobConfig,
        started_by: Option<String>,
    ) -> Result<ImportJob, ImporterError> {
        UnitValidator::for_job(&config)?;
        let job = ImportJob::new(title, source, config, started_by);
        self.store.create_job(&job).await?;
        info!(job_id = %job.id, title = %job.title, "📋 import job created");
        Ok(job)
    }

    /// Replace a draft job's configuration.
    pub async fn update_config(
        &self,
        job_id: Uuid,
        config: JobConfig,
    ) -> Result<(), ImporterError> {
        let job = self.require_job(job_id).await?;
        if job.state != JobState::Draft {
            return Err(ImporterError::ConfigLocked { state: job.state });
        }
        UnitValidator::for_job(&config)?;
        self.store.update_job_config(job_id, &config).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Start a job: a draft job runs the parse/validation phase (and with
    /// `auto_dispatch` proceeds straight into dispatch); a ready job
    /// dispatches.
    pub async fn start(&self, job_id: Uuid) -> Result<(), ImporterError> {
        let mut job = self.require_job(job_id).await?;
        let next = JobStateMachine::apply(job.state, JobCommand::Start)?;

        match next {
            JobState::Validating => {
                self.run_validation_phase(&mut job).await?;
                if job.state == JobState::Ready && job.config.auto_dispatch {
                    self.spawn_dispatch(job_id).await?;
                }
                Ok(())
            }
            JobState::Running => self.spawn_dispatch(job_id).await,
            _ => unreachable!("start never yields another state"),
        }
    }

    /// Suspend dispatch. In-flight units finish, no new units start.
    pub async fn pause(&self, job_id: Uuid) -> Result<(), ImporterError> {
        let job = self.require_job(job_id).await?;
        JobStateMachine::apply(job.state, JobCommand::Pause)?;

        let runs = self.runs.read().await;
        if let Some(handle) = runs.get(&job_id) {
            let _ = handle.control.send(RunSignal::Pause);
            info!(job_id = %job_id, "⏸️ pause signalled");
        } else if job.state == JobState::Running {
            // No live run in this process (e.g. pre-recovery); park directly.
            self.transition(&job, JobState::Paused, None).await?;
        }
        Ok(())
    }

    /// Continue a paused job from the first non-terminal ordinal.
    pub async fn resume(&self, job_id: Uuid) -> Result<(), ImporterError> {
        let job = self.require_job(job_id).await?;
        JobStateMachine::apply(job.state, JobCommand::Resume)?;

        let has_live_run = {
            let runs = self.runs.read().await;
            if let Some(handle) = runs.get(&job_id) {
                let _ = handle.control.send(RunSignal::Run);
                true
            } else {
                false
            }
        };
        if !has_live_run {
            self.spawn_dispatch(job_id).await?;
        }
        Ok(())
    }

    /// Abort a job. In-flight units finish, remaining units stay pending,
    /// counts are frozen. Not resumable.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), ImporterError> {
        let job = self.require_job(job_id).await?;
        if job.state == JobState::Cancelled {
            return Ok(());
        }
        JobStateMachine::apply(job.state, JobCommand::Cancel)?;

        let has_live_run = {
            let runs = self.runs.read().await;
            if let Some(handle) = runs.get(&job_id) {
                let _ = handle.control.send(RunSignal::Cancel);
                true
            } else {
                false
            }
        };
        if !has_live_run {
            self.transition(&job, JobState::Cancelled, None).await?;
            let counts = self.store.job_counts(job_id).await?;
            self.events.job_finished(job_id, JobState::Cancelled, counts);
        }
        Ok(())
    }

    /// Reset failed units to pending and re-enter dispatch. Only failed
    /// units change; other units' states and counts are untouched.
    pub async fn retry_failed(&self, job_id: Uuid) -> Result<(), ImporterError> {
        let job = self.require_job(job_id).await?;
        JobStateMachine::apply(job.state, JobCommand::RetryFailed)?;

        let reset = self.store.reset_failed_units(job_id).await?;
        if reset == 0 {
            return Err(CommandConflict {
                command: JobCommand::RetryFailed,
                state: job.state,
            }
            .into());
        }
        info!(job_id = %job_id, reset, "🔄 failed units reset for retry");
        self.spawn_dispatch(job_id).await
    }

    // ------------------------------------------------------------------
    // Progress and query surface
    // ------------------------------------------------------------------

    /// Current progress: the live atomic mirror while a run is active,
    /// the durable counters otherwise.
    pub async fn progress(&self, job_id: Uuid) -> Result<ProgressSnapshot, ImporterError> {
        if let Some(handle) = self.progress.handle(job_id).await {
            return Ok(handle.snapshot());
        }
        let counts = self.store.job_counts(job_id).await?;
        Ok(ProgressSnapshot::from_counts(counts))
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<ImportJob, ImporterError> {
        self.require_job(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<ImportJob>, ImporterError> {
        Ok(self.store.list_jobs().await?)
    }

    pub async fn list_units(&self, job_id: Uuid) -> Result<Vec<ImportUnit>, ImporterError> {
        Ok(self.store.list_units(job_id).await?)
    }

    pub async fn find_unit(
        &self,
        job_id: Uuid,
        ordinal: u64,
    ) -> Result<Option<ImportUnit>, ImporterError> {
        Ok(self.store.find_unit(job_id, ordinal).await?)
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    /// Re-attach jobs left running or paused by a previous process. Running
    /// jobs resume dispatch; units stuck in `processing` are re-dispatched
    /// with conflict reconciliation. Jobs interrupted mid-validation cannot
    /// resume and fail.
    pub async fn recover(&self) -> Result<(), ImporterError> {
        let jobs = self.store.list_jobs().await?;
        for job in jobs {
            match job.state {
                JobState::Running => {
                    info!(job_id = %job.id, "recovering interrupted run");
                    self.spawn_dispatch(job.id).await?;
                }
                JobState::Validating => {
                    warn!(job_id = %job.id, "job was interrupted during validation, failing it");
                    self.transition(
                        &job,
                        JobState::Failed,
                        Some("interrupted during validation".to_string()),
                    )
                    .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Stop all live runs cooperatively: in-flight units finish, running
    /// jobs park as paused and can be recovered later.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JobHandle> = {
            let mut runs = self.runs.write().await;
            runs.drain().map(|(_, handle)| handle).collect()
        };
        let results = futures::future::join_all(handles.into_iter().map(|h| h.done)).await;
        for result in results {
            if let Err(e) = result {
                error!("run task failed during shutdown: {e}");
            }
        }
        info!("importer service shut down");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn require_job(&self, job_id: Uuid) -> Result<ImportJob, ImporterError> {
        self.store
            .find_job(job_id)
            .await?
            .ok_or(ImporterError::JobNotFound { job_id })
    }

    async fn transition(
        &self,
        job: &ImportJob,
        to: JobState,
        warning: Option<String>,
    ) -> Result<(), ImporterError> {
        self.store.update_job_state(job.id, to, warning).await?;
        self.events.job_state_changed(job.id, job.state, to);
        Ok(())
    }

    /// Parse + validate phase: stream the source file off a blocking task,
    /// validate units as they arrive, and persist them in batches.
    async fn run_validation_phase(&self, job: &mut ImportJob) -> Result<(), ImporterError> {
        self.transition(job, JobState::Validating, None).await?;
        job.state = JobState::Validating;

        let validator = UnitValidator::for_job(&job.config)?;
        let file = self.storage.resolve(&job.source)?;
        let format = job.config.format;
        let batch_size = self.config.engine.validation_batch_size.max(1);

        let (tx, mut rx) =
            mpsc::channel::<Result<RawUnit, ParseError>>(self.config.engine.channel_capacity.max(1));
        let parse_task = tokio::task::spawn_blocking(move || {
            let mut parser = match UnitParser::open(file, &format) {
                Ok(parser) => parser,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            loop {
                match parser.next_unit() {
                    Ok(Some(unit)) => {
                        if tx.blocking_send(Ok(unit)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        return;
                    }
                }
            }
        });

        let mut batch: Vec<ImportUnit> = Vec::with_capacity(batch_size);
        let mut total: u64 = 0;
        let mut invalid: u64 = 0;
        let mut parse_failure: Option<ParseError> = None;

        while let Some(item) = rx.recv().await {
            match item {
                Ok(raw) => {
                    total += 1;
                    let mut unit =
                        ImportUnit::pending(job.id, raw.ordinal, raw.fields.clone(), raw.position);
                    match validator.validate(&raw) {
                        Ok(normalized) => {
                            unit.state = UnitState::Validated;
                            unit.normalized = Some(normalized.fields);
                            unit.fingerprint = Some(normalized.fingerprint);
                        }
                        Err(errors) => {
                            invalid += 1;
                            unit.state = UnitState::Invalid;
                            unit.errors = errors;
                        }
                    }
                    batch.push(unit);
                    if batch.len() >= batch_size {
                        self.store.insert_units(&batch).await?;
                        batch.clear();
                    }
                }
                Err(e) => {
                    parse_failure = Some(e);
                    break;
                }
            }
        }
        drop(rx);
        let _ = parse_task.await;

        // A cancel issued mid-validation writes its terminal state straight
        // to the store (no run exists yet to signal). That state wins; the
        // phase outcome is discarded and the job never reaches dispatch.
        let stored = self.require_job(job.id).await?;
        if stored.state.is_terminal() {
            info!(
                job_id = %job.id,
                state = %stored.state,
                "job ended while validating, discarding validation outcome"
            );
            job.state = stored.state;
            return Ok(());
        }

        if parse_failure.is_none() && total == 0 {
            parse_failure = Some(ParseError::EmptySource);
        }
        if let Some(e) = parse_failure {
            error!(job_id = %job.id, "source rejected: {e}");
            self.transition(job, JobState::Failed, Some(e.to_string()))
                .await?;
            job.state = JobState::Failed;
            return Err(e.into());
        }

        if !batch.is_empty() {
            self.store.insert_units(&batch).await?;
        }
        self.store.set_job_total(job.id, total).await?;

        let next = JobStateMachine::validation_outcome(invalid, job.config.allow_partial);
        let warning = if invalid > 0 {
            Some(format!("{invalid} of {total} units failed validation"))
        } else {
            None
        };
        info!(
            job_id = %job.id,
            total,
            invalid,
            outcome = %next,
            "✅ validation phase finished"
        );
        self.transition(job, next, warning).await?;
        job.state = next;
        Ok(())
    }

    /// Move the job into `running` and launch the dispatcher on a
    /// background task that finalizes the job when the run ends.
    async fn spawn_dispatch(&self, job_id: Uuid) -> Result<(), ImporterError> {
        let job = self.require_job(job_id).await?;

        // Hold the registry lock until the handle is inserted so a run that
        // finishes instantly cannot race its own registration, and two
        // concurrent starts cannot both pass the duplicate check.
        let mut runs = self.runs.write().await;
        if runs.contains_key(&job_id) {
            return Err(CommandConflict {
                command: JobCommand::Start,
                state: job.state,
            }
            .into());
        }

        let counts = self.store.job_counts(job_id).await?;
        let progress = self.progress.register(job_id, counts).await;
        self.transition(&job, JobState::Running, None).await?;

        let processor = Arc::new(UnitProcessor::new(
            Arc::clone(&self.records),
            Duration::from_millis(self.config.engine.unit_timeout_ms),
        ));
        let dispatch_config = DispatchConfig {
            worker_limit: job
                .config
                .worker_limit
                .unwrap_or(self.config.engine.worker_limit),
            retry: job.config.retry.clone().unwrap_or_else(|| self.config.retry.clone()),
            fail_fast: job.config.fail_fast,
        };
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            processor,
            progress,
            self.events.clone(),
            dispatch_config,
            self.shutdown.clone(),
        );

        let (control_tx, control_rx) = watch::channel(RunSignal::Run);
        let service = self.clone();
        let run_job = {
            let mut job = job.clone();
            job.state = JobState::Running;
            job
        };
        let done = tokio::spawn(async move {
            let result = dispatcher.run(&run_job, control_rx).await;
            service.finish_run(run_job, result).await;
        });

        runs.insert(
            job_id,
            JobHandle {
                control: control_tx,
                done,
            },
        );
        Ok(())
    }

    async fn finish_run(
        &self,
        job: ImportJob,
        result: Result<DispatchOutcome, crate::import_engine::dispatcher::DispatchError>,
    ) {
        let job_id = job.id;
        {
            let mut runs = self.runs.write().await;
            runs.remove(&job_id);
        }

        let finished = match result {
            Err(e) => {
                error!(job_id = %job_id, "dispatch run failed: {e}");
                self.transition(&job, JobState::Failed, Some(e.to_string()))
                    .await
                    .map(|()| JobState::Failed)
            }
            Ok(outcome) => {
                let next = match outcome {
                    DispatchOutcome::Drained => match self.store.job_counts(job_id).await {
                        Ok(counts) => JobStateMachine::finalize(counts, false),
                        Err(e) => {
                            error!(job_id = %job_id, "cannot read final counts: {e}");
                            JobState::Failed
                        }
                    },
                    DispatchOutcome::FailFast => JobState::Failed,
                    DispatchOutcome::Paused => JobState::Paused,
                    DispatchOutcome::Cancelled => JobState::Cancelled,
                };
                self.transition(&job, next, None).await.map(|()| next)
            }
        };

        match finished {
            Ok(state) if state.is_terminal() => {
                let counts = self
                    .store
                    .job_counts(job_id)
                    .await
                    .unwrap_or(job.counts);
                info!(job_id = %job_id, %state, ?counts, "🏁 import job finished");
                self.events.job_finished(job_id, state, counts);
            }
            Ok(state) => {
                info!(job_id = %job_id, %state, "run parked");
            }
            Err(e) => {
                error!(job_id = %job_id, "failed to persist final job state: {e}");
            }
        }
        self.progress.deregister(job_id).await;
    }
}
