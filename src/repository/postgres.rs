//! # PostgreSQL Process Repository
//!
//! ## Claiming
//!
//! A poll claims at most one process with a single statement: the candidate process is
//! selected `FOR UPDATE OF p SKIP LOCKED` and leased in the same `UPDATE`, so two workers
//! polling at the same time never receive the same process. The lease is a timestamp rather
//! than a held row lock; a crashed worker's processes become claimable again once
//! `lock_expiry_date` passes.
//!
//! ## Committing
//!
//! [`persist_step_outcome`](ProcessRepository::persist_step_outcome) runs in one transaction
//! whose first statement is the version compare-and-set on the process row. A stale commit
//! therefore fails before touching any step.
//!
//! Every writing transaction takes the process row before any of its step rows, so concurrent
//! writers on one process queue behind the version check instead of deadlocking.

use super::{
    ClaimedProcess, ExecutableStepFilter, PersistedOutcome, ProcessRepository, StepOutcome,
};
use crate::error::{ProcessError, ProcessResult};
use crate::models::{Process, ProcessStep};
use crate::state_machine::ProcessStepStatus;
use crate::taxonomy::TypeCode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

const PROCESS_COLUMNS: &str = "id, process_type_id, version, lock_expiry_date, date_created";

const STEP_COLUMNS: &str = "id, process_id, process_step_type_id, process_step_status_id, \
                            message, date_created, date_last_changed";

#[derive(Debug, FromRow)]
struct ProcessRow {
    id: Uuid,
    process_type_id: i32,
    version: i64,
    lock_expiry_date: Option<DateTime<Utc>>,
    date_created: DateTime<Utc>,
}

impl ProcessRow {
    fn into_process<P: TypeCode>(self) -> ProcessResult<Process<P>> {
        let process_type_id = P::from_code(self.process_type_id).ok_or_else(|| {
            ProcessError::Database(format!(
                "process {} has unknown process type code {}",
                self.id, self.process_type_id
            ))
        })?;
        Ok(Process {
            id: self.id,
            process_type_id,
            version: self.version,
            lock_expiry_date: self.lock_expiry_date,
            date_created: self.date_created,
        })
    }
}

#[derive(Debug, FromRow)]
struct ProcessStepRow {
    id: Uuid,
    process_id: Uuid,
    process_step_type_id: i32,
    process_step_status_id: i32,
    message: Option<String>,
    date_created: DateTime<Utc>,
    date_last_changed: Option<DateTime<Utc>>,
}

impl ProcessStepRow {
    fn into_step<S: TypeCode>(self) -> ProcessResult<ProcessStep<S>> {
        let process_step_type_id = S::from_code(self.process_step_type_id).ok_or_else(|| {
            ProcessError::Database(format!(
                "process step {} has unknown step type code {}",
                self.id, self.process_step_type_id
            ))
        })?;
        let process_step_status_id = ProcessStepStatus::from_code(self.process_step_status_id)
            .ok_or_else(|| {
                ProcessError::Database(format!(
                    "process step {} has unknown status code {}",
                    self.id, self.process_step_status_id
                ))
            })?;
        Ok(ProcessStep {
            id: self.id,
            process_id: self.process_id,
            process_step_type_id,
            process_step_status_id,
            message: self.message,
            date_created: self.date_created,
            date_last_changed: self.date_last_changed,
        })
    }
}

fn into_steps<S: TypeCode>(rows: Vec<ProcessStepRow>) -> ProcessResult<Vec<ProcessStep<S>>> {
    rows.into_iter().map(ProcessStepRow::into_step).collect()
}

/// Process repository backed by the `processes` and `process_steps` tables
pub struct PgProcessRepository<P, S> {
    pool: PgPool,
    _types: PhantomData<fn() -> (P, S)>,
}

impl<P, S> Clone for PgProcessRepository<P, S> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _types: PhantomData,
        }
    }
}

impl<P: TypeCode, S: TypeCode> PgProcessRepository<P, S> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _types: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_steps(
        conn: &mut PgConnection,
        process_id: Uuid,
    ) -> ProcessResult<Vec<ProcessStep<S>>> {
        let rows = sqlx::query_as::<_, ProcessStepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM process_steps WHERE process_id = $1 \
             ORDER BY date_created, id"
        ))
        .bind(process_id)
        .fetch_all(conn)
        .await?;
        into_steps(rows)
    }

    async fn insert_step(
        &self,
        process_id: Uuid,
        process_step_type_id: S,
        status: ProcessStepStatus,
        expected_version: Option<i64>,
    ) -> ProcessResult<ProcessStep<S>> {
        let mut tx = self.pool.begin().await?;
        Self::bump_version(&mut tx, process_id, expected_version, false).await?;

        let step = sqlx::query_as::<_, ProcessStepRow>(&format!(
            "INSERT INTO process_steps \
             (id, process_id, process_step_type_id, process_step_status_id, date_created) \
             VALUES ($1, $2, $3, $4, clock_timestamp()) \
             RETURNING {STEP_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(process_id)
        .bind(process_step_type_id.code())
        .bind(status.code())
        .fetch_one(&mut *tx)
        .await?
        .into_step()?;

        tx.commit().await?;
        Ok(step)
    }

    /// Owning process of a step, read without a row lock
    async fn step_process_id(conn: &mut PgConnection, step_id: Uuid) -> ProcessResult<Uuid> {
        sqlx::query_scalar("SELECT process_id FROM process_steps WHERE id = $1")
            .bind(step_id)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| ProcessError::step_not_found(step_id))
    }

    async fn lock_step(
        conn: &mut PgConnection,
        step_id: Uuid,
    ) -> ProcessResult<ProcessStep<S>> {
        sqlx::query_as::<_, ProcessStepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM process_steps WHERE id = $1 FOR UPDATE"
        ))
        .bind(step_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| ProcessError::step_not_found(step_id))?
        .into_step()
    }

    /// Version compare-and-set on the process row, optionally releasing the lease
    async fn bump_version(
        conn: &mut PgConnection,
        process_id: Uuid,
        expected_version: Option<i64>,
        release_lease: bool,
    ) -> ProcessResult<Process<P>> {
        let row = sqlx::query_as::<_, ProcessRow>(&format!(
            "UPDATE processes \
             SET version = version + 1, \
                 lock_expiry_date = CASE WHEN $3 THEN NULL ELSE lock_expiry_date END \
             WHERE id = $1 AND ($2::BIGINT IS NULL OR version = $2) \
             RETURNING {PROCESS_COLUMNS}"
        ))
        .bind(process_id)
        .bind(expected_version)
        .bind(release_lease)
        .fetch_optional(&mut *conn)
        .await?;

        match (row, expected_version) {
            (Some(row), _) => row.into_process(),
            (None, Some(expected_version)) => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM processes WHERE id = $1)")
                        .bind(process_id)
                        .fetch_one(conn)
                        .await?;
                if exists {
                    Err(ProcessError::version_conflict(process_id, expected_version))
                } else {
                    Err(ProcessError::process_not_found(process_id))
                }
            }
            (None, None) => Err(ProcessError::process_not_found(process_id)),
        }
    }
}

#[async_trait]
impl<P: TypeCode, S: TypeCode> ProcessRepository<P, S> for PgProcessRepository<P, S> {
    async fn create_process(&self, process_type_id: P) -> ProcessResult<Process<P>> {
        sqlx::query_as::<_, ProcessRow>(&format!(
            "INSERT INTO processes (id, process_type_id, version, lock_expiry_date, date_created) \
             VALUES ($1, $2, $3, NULL, NOW()) \
             RETURNING {PROCESS_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(process_type_id.code())
        .bind(Process::<P>::INITIAL_VERSION)
        .fetch_one(&self.pool)
        .await?
        .into_process()
    }

    async fn create_process_step(
        &self,
        process_id: Uuid,
        process_step_type_id: S,
        status: ProcessStepStatus,
    ) -> ProcessResult<ProcessStep<S>> {
        self.insert_step(process_id, process_step_type_id, status, None)
            .await
    }

    async fn create_process_step_at_version(
        &self,
        process_id: Uuid,
        process_step_type_id: S,
        status: ProcessStepStatus,
        expected_version: i64,
    ) -> ProcessResult<ProcessStep<S>> {
        self.insert_step(process_id, process_step_type_id, status, Some(expected_version))
            .await
    }

    async fn get_process(&self, process_id: Uuid) -> ProcessResult<Option<Process<P>>> {
        sqlx::query_as::<_, ProcessRow>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM processes WHERE id = $1"
        ))
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ProcessRow::into_process)
        .transpose()
    }

    async fn get_process_steps(&self, process_id: Uuid) -> ProcessResult<Vec<ProcessStep<S>>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_steps(&mut conn, process_id).await
    }

    async fn get_process_step(&self, step_id: Uuid) -> ProcessResult<Option<ProcessStep<S>>> {
        sqlx::query_as::<_, ProcessStepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM process_steps WHERE id = $1"
        ))
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ProcessStepRow::into_step)
        .transpose()
    }

    #[instrument(skip(self, filter))]
    async fn get_process_with_next_executable_step(
        &self,
        filter: &ExecutableStepFilter<P, S>,
        lock_expiry: Duration,
    ) -> ProcessResult<Option<ClaimedProcess<P, S>>> {
        if filter.is_empty() {
            return Ok(None);
        }
        let (process_type_codes, step_type_codes) = filter.code_pairs();

        let query = r#"
            WITH eligible AS (
                SELECT ps.process_id, MIN(ps.date_created) AS oldest_step
                FROM process_steps ps
                JOIN processes p ON p.id = ps.process_id
                JOIN UNNEST($1::INTEGER[], $2::INTEGER[]) AS f(process_type_id, process_step_type_id)
                  ON f.process_type_id = p.process_type_id
                 AND f.process_step_type_id = ps.process_step_type_id
                WHERE ps.process_step_status_id = $3
                  AND (p.lock_expiry_date IS NULL OR p.lock_expiry_date <= NOW())
                GROUP BY ps.process_id
            ),
            candidate AS (
                SELECT p.id
                FROM processes p
                JOIN eligible e ON e.process_id = p.id
                WHERE p.lock_expiry_date IS NULL OR p.lock_expiry_date <= NOW()
                ORDER BY e.oldest_step, p.id
                LIMIT 1
                FOR UPDATE OF p SKIP LOCKED
            )
            UPDATE processes p
            SET lock_expiry_date = NOW() + make_interval(secs => $4),
                version = p.version + 1
            FROM candidate c
            WHERE p.id = c.id
            RETURNING p.id, p.process_type_id, p.version, p.lock_expiry_date, p.date_created
            "#;

        let claimed = sqlx::query_as::<_, ProcessRow>(query)
            .bind(&process_type_codes)
            .bind(&step_type_codes)
            .bind(ProcessStepStatus::Todo.code())
            .bind(lock_expiry.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to claim process: {}", e);
                ProcessError::Database(format!("Process claiming failed: {e}"))
            })?;

        let Some(row) = claimed else {
            debug!("No executable process available for claiming");
            return Ok(None);
        };
        let process: Process<P> = row.into_process()?;

        let mut conn = self.pool.acquire().await?;
        let steps = Self::load_steps(&mut conn, process.id).await?;
        let step = steps
            .iter()
            .find(|s| s.is_todo() && filter.contains(process.process_type_id, s.process_step_type_id))
            .cloned();

        match step {
            Some(step) => {
                debug!(
                    process_id = %process.id,
                    step_id = %step.id,
                    step_type = %step.process_step_type_id,
                    version = process.version,
                    "Claimed process"
                );
                Ok(Some(ClaimedProcess {
                    process,
                    step,
                    steps,
                }))
            }
            None => {
                // the eligible step changed between the claim and the load
                warn!(process_id = %process.id, "Claimed process has no executable step, releasing");
                Self::bump_version(&mut conn, process.id, Some(process.version), true).await?;
                Ok(None)
            }
        }
    }

    async fn update_process_step_status(
        &self,
        step_id: Uuid,
        status: ProcessStepStatus,
        message: Option<String>,
        expected_version: i64,
    ) -> ProcessResult<Process<P>> {
        let mut tx = self.pool.begin().await?;
        let process_id = Self::step_process_id(&mut tx, step_id).await?;
        let process =
            Self::bump_version(&mut tx, process_id, Some(expected_version), false).await?;
        let step = Self::lock_step(&mut tx, step_id).await?;
        step.process_step_status_id.transition_to(status)?;

        sqlx::query(
            "UPDATE process_steps \
             SET process_step_status_id = $2, message = $3, date_last_changed = NOW() \
             WHERE id = $1",
        )
        .bind(step_id)
        .bind(status.code())
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(process)
    }

    async fn requeue_step(
        &self,
        step_id: Uuid,
        expected_version: i64,
    ) -> ProcessResult<ProcessStep<S>> {
        let mut tx = self.pool.begin().await?;
        let process_id = Self::step_process_id(&mut tx, step_id).await?;
        Self::bump_version(&mut tx, process_id, Some(expected_version), false).await?;
        let step = Self::lock_step(&mut tx, step_id).await?;
        let current = step.process_step_status_id;
        if !current.can_requeue() {
            return Err(ProcessError::Conflict(format!(
                "step {step_id} is {current} and cannot be requeued"
            )));
        }

        let requeued = sqlx::query_as::<_, ProcessStepRow>(&format!(
            "UPDATE process_steps \
             SET process_step_status_id = $2, message = NULL, date_last_changed = NOW() \
             WHERE id = $1 \
             RETURNING {STEP_COLUMNS}"
        ))
        .bind(step_id)
        .bind(ProcessStepStatus::Todo.code())
        .fetch_one(&mut *tx)
        .await?
        .into_step()?;

        tx.commit().await?;
        Ok(requeued)
    }

    #[instrument(skip(self, outcome), fields(process_id = %outcome.process_id, step_id = %outcome.step_id))]
    async fn persist_step_outcome(
        &self,
        outcome: StepOutcome<S>,
    ) -> ProcessResult<PersistedOutcome<P, S>> {
        let process_id = outcome.process_id;
        let mut tx = self.pool.begin().await?;
        let process =
            Self::bump_version(&mut tx, process_id, Some(outcome.expected_version), true).await?;

        let executed: ProcessStep<S> = Self::lock_step(&mut tx, outcome.step_id).await?;
        if executed.process_id != process_id || !executed.is_todo() {
            return Err(ProcessError::Conflict(format!(
                "step {} is no longer pending on process {process_id}",
                outcome.step_id
            )));
        }

        if outcome.status == ProcessStepStatus::Todo {
            sqlx::query(
                "UPDATE process_steps \
                 SET message = COALESCE($2, message), date_last_changed = NOW() \
                 WHERE id = $1",
            )
            .bind(outcome.step_id)
            .bind(&outcome.message)
            .execute(&mut *tx)
            .await?;
        } else {
            executed.process_step_status_id.transition_to(outcome.status)?;
            sqlx::query(
                "UPDATE process_steps \
                 SET process_step_status_id = $2, message = $3, date_last_changed = NOW() \
                 WHERE id = $1",
            )
            .bind(outcome.step_id)
            .bind(outcome.status.code())
            .bind(&outcome.message)
            .execute(&mut *tx)
            .await?;
        }

        if !outcome.duplicate_step_ids.is_empty() {
            let owned: Vec<Uuid> = sqlx::query_scalar(
                "SELECT id FROM process_steps \
                 WHERE id = ANY($1) AND process_id = $2 AND id <> $3",
            )
            .bind(&outcome.duplicate_step_ids)
            .bind(process_id)
            .bind(outcome.step_id)
            .fetch_all(&mut *tx)
            .await?;
            if let Some(unknown) = outcome
                .duplicate_step_ids
                .iter()
                .find(|id| !owned.contains(id))
            {
                return Err(ProcessError::Validation(format!(
                    "step {unknown} cannot be marked as duplicate of {}",
                    outcome.step_id
                )));
            }

            sqlx::query(
                "UPDATE process_steps \
                 SET process_step_status_id = $2, message = NULL, date_last_changed = NOW() \
                 WHERE id = ANY($1) AND process_step_status_id = $3",
            )
            .bind(&outcome.duplicate_step_ids)
            .bind(ProcessStepStatus::Duplicate.code())
            .bind(ProcessStepStatus::Todo.code())
            .execute(&mut *tx)
            .await?;
        }

        let skipped_step_ids: Vec<Uuid> = if outcome.skip_step_type_ids.is_empty() {
            Vec::new()
        } else {
            let skip_codes: Vec<i32> = outcome
                .skip_step_type_ids
                .iter()
                .map(|step_type| step_type.code())
                .collect();
            sqlx::query_scalar(
                "UPDATE process_steps \
                 SET process_step_status_id = $4, message = NULL, date_last_changed = NOW() \
                 WHERE process_id = $1 AND id <> $2 \
                   AND process_step_status_id = $5 \
                   AND process_step_type_id = ANY($3) \
                 RETURNING id",
            )
            .bind(process_id)
            .bind(outcome.step_id)
            .bind(&skip_codes)
            .bind(ProcessStepStatus::Skipped.code())
            .bind(ProcessStepStatus::Todo.code())
            .fetch_all(&mut *tx)
            .await?
        };

        let mut created_steps = Vec::new();
        for step_type in outcome.distinct_schedule_step_type_ids() {
            let created = sqlx::query_as::<_, ProcessStepRow>(&format!(
                "INSERT INTO process_steps \
                 (id, process_id, process_step_type_id, process_step_status_id, date_created) \
                 SELECT $1, $2, $3, $4, clock_timestamp() \
                 WHERE NOT EXISTS ( \
                     SELECT 1 FROM process_steps \
                     WHERE process_id = $2 AND process_step_type_id = $3 \
                       AND process_step_status_id = $4) \
                 RETURNING {STEP_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(process_id)
            .bind(step_type.code())
            .bind(ProcessStepStatus::Todo.code())
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = created {
                created_steps.push(row.into_step()?);
            }
        }

        let has_todo_steps: bool = sqlx::query_scalar(
            "SELECT EXISTS ( \
                 SELECT 1 FROM process_steps \
                 WHERE process_id = $1 AND process_step_status_id = $2)",
        )
        .bind(process_id)
        .bind(ProcessStepStatus::Todo.code())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PersistedOutcome {
            process,
            created_steps,
            skipped_step_ids,
            has_todo_steps,
        })
    }

    async fn release_lock(
        &self,
        process_id: Uuid,
        expected_version: i64,
    ) -> ProcessResult<Process<P>> {
        let mut conn = self.pool.acquire().await?;
        Self::bump_version(&mut conn, process_id, Some(expected_version), true).await
    }
}
