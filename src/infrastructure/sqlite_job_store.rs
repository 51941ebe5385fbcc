//! Sqlite-backed job store
//!
//! Jobs and units live in two tables keyed by job id and (job id, ordinal).
//! JSON columns hold the structured payloads (config, raw/normalized fields,
//! validation errors); timestamps are rfc3339 text. The mark-terminal write
//! runs in a transaction guarded against units that are already terminal, so
//! the aggregate counters are incremented exactly once per unit per run.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::job::{FileReference, ImportJob, JobConfig, JobState, UnitCounts};
use crate::domain::repositories::JobStore;
use crate::domain::unit::{
    FailureKind, ImportUnit, UnitFailure, UnitOutcome, UnitState,
};
use crate::import_engine::parser::SourcePosition;

const TERMINAL_UNIT_STATES: &str = "('succeeded', 'failed', 'skipped', 'invalid')";

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if missing) the database at `url` and ensure the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid sqlite url: {url}"))?
            .create_if_missing(true);
        // In-memory sqlite databases are per-connection; a pool of them
        // would each see an empty schema.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to open sqlite database")?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_jobs (
                job_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                source_ref TEXT NOT NULL,
                config_json TEXT NOT NULL,
                state TEXT NOT NULL,
                warning TEXT,
                total_units INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                started_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS import_units (
                job_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                state TEXT NOT NULL,
                raw_json TEXT NOT NULL,
                normalized_json TEXT,
                fingerprint TEXT,
                record_id TEXT,
                errors_json TEXT NOT NULL DEFAULT '[]',
                failure_kind TEXT,
                failure_detail TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                pos_byte INTEGER NOT NULL DEFAULT 0,
                pos_line INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (job_id, ordinal),
                FOREIGN KEY (job_id) REFERENCES import_jobs (job_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_units_job_state
             ON import_units (job_id, state, ordinal)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp in database: {text}"))
}

fn parse_optional_timestamp(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.map(|t| parse_timestamp(&t)).transpose()
}

fn row_to_job(row: &SqliteRow) -> Result<ImportJob> {
    let job_id: String = row.try_get("job_id")?;
    let state: String = row.try_get("state")?;
    let config_json: String = row.try_get("config_json")?;
    let config: JobConfig =
        serde_json::from_str(&config_json).context("invalid job config in database")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ImportJob {
        id: Uuid::parse_str(&job_id).context("invalid job id in database")?,
        title: row.try_get("title")?,
        source: FileReference::new(row.try_get::<String, _>("source_ref")?),
        config,
        state: JobState::parse(&state).map_err(|e| anyhow!(e))?,
        counts: UnitCounts {
            total: row.try_get::<i64, _>("total_units")? as u64,
            succeeded: row.try_get::<i64, _>("succeeded")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            skipped: row.try_get::<i64, _>("skipped")? as u64,
        },
        warning: row.try_get("warning")?,
        started_by: row.try_get("started_by")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        started_at: parse_optional_timestamp(row.try_get("started_at")?)?,
        finished_at: parse_optional_timestamp(row.try_get("finished_at")?)?,
    })
}

fn row_to_unit(row: &SqliteRow) -> Result<ImportUnit> {
    let job_id: String = row.try_get("job_id")?;
    let ordinal = row.try_get::<i64, _>("ordinal")? as u64;
    let state: String = row.try_get("state")?;
    let raw_json: String = row.try_get("raw_json")?;
    let normalized_json: Option<String> = row.try_get("normalized_json")?;
    let errors_json: String = row.try_get("errors_json")?;
    let failure_kind: Option<String> = row.try_get("failure_kind")?;
    let failure_detail: Option<String> = row.try_get("failure_detail")?;
    let updated_at: String = row.try_get("updated_at")?;

    let failure = match (failure_kind, failure_detail) {
        (Some(kind), detail) => Some(UnitFailure {
            kind: FailureKind::parse(&kind).map_err(|e| anyhow!(e))?,
            detail: detail.unwrap_or_default(),
        }),
        (None, _) => None,
    };

    Ok(ImportUnit {
        job_id: Uuid::parse_str(&job_id).context("invalid job id in database")?,
        ordinal,
        state: UnitState::parse(&state).map_err(|e| anyhow!(e))?,
        raw: serde_json::from_str(&raw_json).context("invalid raw payload in database")?,
        normalized: normalized_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .context("invalid normalized payload in database")?,
        fingerprint: row.try_get("fingerprint")?,
        record_id: row.try_get("record_id")?,
        errors: serde_json::from_str(&errors_json)
            .context("invalid validation errors in database")?,
        failure,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        position: SourcePosition {
            byte: row.try_get::<i64, _>("pos_byte")? as u64,
            line: row.try_get::<i64, _>("pos_line")? as u64,
            record: ordinal,
        },
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &ImportJob) -> Result<()> {
        let config_json = serde_json::to_string(&job.config)?;
        sqlx::query(
            r#"
            INSERT INTO import_jobs
                (job_id, title, source_ref, config_json, state, warning,
                 total_units, succeeded, failed, skipped, started_by,
                 created_at, updated_at, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.title)
        .bind(job.source.as_str())
        .bind(config_json)
        .bind(job.state.as_str())
        .bind(&job.warning)
        .bind(job.counts.total as i64)
        .bind(job.counts.succeeded as i64)
        .bind(job.counts.failed as i64)
        .bind(job.counts.skipped as i64)
        .bind(&job.started_by)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        let row = sqlx::query("SELECT * FROM import_jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<ImportJob>> {
        let rows = sqlx::query("SELECT * FROM import_jobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn update_job_state(
        &self,
        job_id: Uuid,
        state: JobState,
        warning: Option<String>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE import_jobs SET
                state = ?,
                warning = COALESCE(?, warning),
                started_at = CASE WHEN ? AND started_at IS NULL THEN ? ELSE started_at END,
                finished_at = CASE WHEN ? THEN COALESCE(finished_at, ?) ELSE NULL END,
                updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(warning)
        .bind(state == JobState::Running)
        .bind(&now)
        .bind(state.is_terminal())
        .bind(&now)
        .bind(&now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job {job_id} not found");
        }
        Ok(())
    }

    async fn update_job_config(&self, job_id: Uuid, config: &JobConfig) -> Result<()> {
        let config_json = serde_json::to_string(config)?;
        let result = sqlx::query(
            "UPDATE import_jobs SET config_json = ?, updated_at = ? WHERE job_id = ?",
        )
        .bind(config_json)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job {job_id} not found");
        }
        Ok(())
    }

    async fn set_job_total(&self, job_id: Uuid, total: u64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs SET total_units = ?, updated_at = ?
            WHERE job_id = ? AND (total_units = 0 OR total_units = ?)
            "#,
        )
        .bind(total as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .bind(total as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job {job_id} not found or total already set");
        }
        Ok(())
    }

    async fn insert_units(&self, units: &[ImportUnit]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut invalid_by_job: std::collections::HashMap<Uuid, i64> =
            std::collections::HashMap::new();

        for unit in units {
            let raw_json = serde_json::to_string(&unit.raw)?;
            let normalized_json = unit
                .normalized
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let errors_json = serde_json::to_string(&unit.errors)?;

            sqlx::query(
                r#"
                INSERT INTO import_units
                    (job_id, ordinal, state, raw_json, normalized_json, fingerprint,
                     record_id, errors_json, failure_kind, failure_detail, attempts,
                     pos_byte, pos_line, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(unit.job_id.to_string())
            .bind(unit.ordinal as i64)
            .bind(unit.state.as_str())
            .bind(raw_json)
            .bind(normalized_json)
            .bind(&unit.fingerprint)
            .bind(&unit.record_id)
            .bind(errors_json)
            .bind(unit.failure.as_ref().map(|f| f.kind.as_str()))
            .bind(unit.failure.as_ref().map(|f| f.detail.clone()))
            .bind(unit.attempts as i64)
            .bind(unit.position.byte as i64)
            .bind(unit.position.line as i64)
            .bind(unit.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            if unit.state == UnitState::Invalid {
                *invalid_by_job.entry(unit.job_id).or_default() += 1;
            }
        }

        for (job_id, invalid) in invalid_by_job {
            sqlx::query(
                "UPDATE import_jobs SET failed = failed + ?, updated_at = ? WHERE job_id = ?",
            )
            .bind(invalid)
            .bind(Utc::now().to_rfc3339())
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_unit_processing(&self, job_id: Uuid, ordinal: u64, attempt: u32) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE import_units SET state = 'processing', attempts = ?, updated_at = ?
            WHERE job_id = ? AND ordinal = ?
            "#,
        )
        .bind(attempt as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .bind(ordinal as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("unit ({job_id}, {ordinal}) not found");
        }
        Ok(())
    }

    async fn mark_unit_terminal(
        &self,
        job_id: Uuid,
        ordinal: u64,
        outcome: &UnitOutcome,
    ) -> Result<()> {
        let state = outcome.state();
        let (record_id, failure) = match outcome {
            UnitOutcome::Succeeded { record_id } => (record_id.clone(), None),
            UnitOutcome::Skipped { .. } => (None, None),
            UnitOutcome::Failed { failure } => (None, Some(failure.clone())),
        };

        let mut tx = self.pool.begin().await?;

        // The state guard keeps re-dispatched duplicates from double-counting.
        let updated = sqlx::query(&format!(
            r#"
            UPDATE import_units SET
                state = ?,
                record_id = COALESCE(?, record_id),
                failure_kind = ?,
                failure_detail = ?,
                updated_at = ?
            WHERE job_id = ? AND ordinal = ? AND state NOT IN {TERMINAL_UNIT_STATES}
            "#
        ))
        .bind(state.as_str())
        .bind(record_id)
        .bind(failure.as_ref().map(|f| f.kind.as_str()))
        .bind(failure.as_ref().map(|f| f.detail.clone()))
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .bind(ordinal as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            bail!("unit ({job_id}, {ordinal}) not found or already terminal");
        }

        let counter = match state {
            UnitState::Succeeded => "succeeded",
            UnitState::Failed => "failed",
            UnitState::Skipped => "skipped",
            other => bail!("state {other} is not a terminal outcome"),
        };
        sqlx::query(&format!(
            "UPDATE import_jobs SET {counter} = {counter} + 1, updated_at = ? WHERE job_id = ?"
        ))
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reset_failed_units(&self, job_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE import_units SET
                state = 'pending',
                failure_kind = NULL,
                failure_detail = NULL,
                attempts = 0,
                updated_at = ?
            WHERE job_id = ? AND state = 'failed'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            sqlx::query(
                "UPDATE import_jobs SET failed = MAX(failed - ?, 0), updated_at = ? WHERE job_id = ?",
            )
            .bind(reset as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(reset)
    }

    async fn next_dispatchable(
        &self,
        job_id: Uuid,
        from_ordinal: u64,
    ) -> Result<Option<ImportUnit>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM import_units
            WHERE job_id = ? AND ordinal >= ?
              AND (state = 'validated' OR (state = 'pending' AND normalized_json IS NOT NULL))
            ORDER BY ordinal
            LIMIT 1
            "#,
        )
        .bind(job_id.to_string())
        .bind(from_ordinal as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_unit).transpose()
    }

    async fn units_in_state(&self, job_id: Uuid, state: UnitState) -> Result<Vec<ImportUnit>> {
        let rows = sqlx::query(
            "SELECT * FROM import_units WHERE job_id = ? AND state = ? ORDER BY ordinal",
        )
        .bind(job_id.to_string())
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_unit).collect()
    }

    async fn find_unit(&self, job_id: Uuid, ordinal: u64) -> Result<Option<ImportUnit>> {
        let row = sqlx::query("SELECT * FROM import_units WHERE job_id = ? AND ordinal = ?")
            .bind(job_id.to_string())
            .bind(ordinal as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_unit).transpose()
    }

    async fn list_units(&self, job_id: Uuid) -> Result<Vec<ImportUnit>> {
        let rows = sqlx::query("SELECT * FROM import_units WHERE job_id = ? ORDER BY ordinal")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_unit).collect()
    }

    async fn job_counts(&self, job_id: Uuid) -> Result<UnitCounts> {
        let row = sqlx::query(
            "SELECT total_units, succeeded, failed, skipped FROM import_jobs WHERE job_id = ?",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("job {job_id} not found"))?;

        Ok(UnitCounts {
            total: row.try_get::<i64, _>("total_units")? as u64,
            succeeded: row.try_get::<i64, _>("succeeded")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            skipped: row.try_get::<i64, _>("skipped")? as u64,
        })
    }
}
