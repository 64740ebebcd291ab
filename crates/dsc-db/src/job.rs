//! The durable job queue.
//!
//! Storage is the `jobs` table; mutual exclusion is Postgres row locking.
//! `claim_next_job` must run inside a caller transaction: a candidate row
//! that fails the per-target cap is simply left selected-but-unclaimed, and
//! the row lock dissolves when the transaction ends.
//!
//! Completion and failure guard on `status = 'running'` so a cancellation
//! that landed mid-execution is never overwritten: at-least-once delivery
//! with terminal states preserved.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use dsc_config::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    RunPipeline,
    VerifyAsset,
    VerifyService,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::RunPipeline => "run_pipeline",
            JobType::VerifyAsset => "verify_asset",
            JobType::VerifyService => "verify_service",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "run_pipeline" => Ok(JobType::RunPipeline),
            "verify_asset" => Ok(JobType::VerifyAsset),
            "verify_service" => Ok(JobType::VerifyService),
            other => Err(anyhow!("invalid job type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(anyhow!("invalid job status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub target_id: Uuid,
    pub run_id: Option<Uuid>,
    pub payload: Option<Value>,
    pub available_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn job_from_row(row: &PgRow) -> Result<JobRow> {
    Ok(JobRow {
        id: row.try_get("id")?,
        job_type: JobType::parse(&row.try_get::<String, _>("type")?)?,
        status: JobStatus::parse(&row.try_get::<String, _>("status")?)?,
        target_id: row.try_get("target_id")?,
        run_id: row.try_get("run_id")?,
        payload: row.try_get("payload")?,
        available_at: row.try_get("available_at")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const JOB_COLUMNS: &str = "id, type, status, target_id, run_id, payload, available_at, \
     locked_at, locked_by, attempts, last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub target_id: Uuid,
    pub run_id: Option<Uuid>,
    pub payload: Value,
    pub available_at: Option<DateTime<Utc>>,
}

/// Insert a queued job. Executes on a caller connection so enqueues ride the
/// scheduler's / sweep's enclosing transaction.
pub async fn enqueue_job(conn: &mut PgConnection, new: &NewJob) -> Result<JobRow> {
    let row = sqlx::query(&format!(
        r#"
        insert into jobs (id, type, status, target_id, run_id, payload, available_at)
        values ($1, $2, 'queued', $3, $4, $5, coalesce($6, now()))
        returning {JOB_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(new.job_type.as_str())
    .bind(new.target_id)
    .bind(new.run_id)
    .bind(&new.payload)
    .bind(new.available_at)
    .fetch_one(conn)
    .await
    .context("enqueue_job failed")?;

    job_from_row(&row)
}

pub async fn fetch_job(pool: &PgPool, job_id: Uuid) -> Result<Option<JobRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {JOB_COLUMNS}
        from jobs
        where id = $1
        "#
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
    .context("fetch_job failed")?;

    row.as_ref().map(job_from_row).transpose()
}

async fn count_running(conn: &mut PgConnection, target_id: Option<Uuid>) -> Result<i64> {
    let (n,): (i64,) = match target_id {
        Some(tid) => {
            sqlx::query_as(
                r#"
                select count(*)::bigint
                from jobs
                where status = 'running'
                  and target_id = $1
                "#,
            )
            .bind(tid)
            .fetch_one(conn)
            .await
        }
        None => {
            sqlx::query_as(
                r#"
                select count(*)::bigint
                from jobs
                where status = 'running'
                "#,
            )
            .fetch_one(conn)
            .await
        }
    }
    .context("count_running failed")?;

    Ok(n)
}

/// Per-target cap: the target's `scope.max_concurrent_jobs` when present,
/// the global per-target default otherwise.
async fn per_target_limit(
    conn: &mut PgConnection,
    target_id: Uuid,
    settings: &Settings,
) -> Result<i64> {
    let row: Option<(Option<i64>,)> = sqlx::query_as(
        r#"
        select (scope ->> 'max_concurrent_jobs')::bigint
        from targets
        where id = $1
        "#,
    )
    .bind(target_id)
    .fetch_optional(conn)
    .await
    .context("per_target_limit failed")?;

    Ok(row
        .and_then(|(limit,)| limit)
        .unwrap_or(settings.max_concurrent_jobs_per_target))
}

/// Candidates inspected per claim before giving up. Bounds the scan when
/// the head of the queue belongs to saturated targets.
const CLAIM_SCAN_LIMIT: usize = 25;

/// Claim one due job for this worker, or return `None`.
///
/// Must be called inside a transaction the caller commits. The claim order
/// is FIFO by `(available_at, created_at)`; `FOR UPDATE SKIP LOCKED` makes
/// concurrent workers skip rather than block on each other's candidate. A
/// candidate refused by its target's cap is passed over so other targets
/// still proceed; refused rows stay queued and their row locks dissolve
/// when the caller's transaction ends.
pub async fn claim_next_job(
    conn: &mut PgConnection,
    settings: &Settings,
    worker_id: &str,
) -> Result<Option<JobRow>> {
    let running_global = count_running(conn, None).await?;
    if running_global >= settings.max_concurrent_jobs_global {
        return Ok(None);
    }

    let mut passed_over: Vec<Uuid> = Vec::new();

    while passed_over.len() < CLAIM_SCAN_LIMIT {
        let candidate: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            select id, target_id
            from jobs
            where status = 'queued'
              and (available_at is null or available_at <= now())
              and id <> all($1)
            order by available_at asc nulls first, created_at asc
            limit 1
            for update skip locked
            "#,
        )
        .bind(&passed_over)
        .fetch_optional(&mut *conn)
        .await
        .context("claim_next_job candidate select failed")?;

        let Some((job_id, target_id)) = candidate else {
            return Ok(None);
        };

        let limit = per_target_limit(conn, target_id, settings).await?;
        let running_for_target = count_running(conn, Some(target_id)).await?;
        if running_for_target >= limit {
            passed_over.push(job_id);
            continue;
        }

        let row = sqlx::query(&format!(
            r#"
            update jobs
            set status = 'running',
                locked_at = now(),
                locked_by = $2,
                attempts = attempts + 1,
                updated_at = now()
            where id = $1
            returning {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .fetch_one(conn)
        .await
        .context("claim_next_job update failed")?;

        return Ok(Some(job_from_row(&row)?));
    }

    Ok(None)
}

/// `running → completed`. Rows in any other state (e.g. cancelled while the
/// worker was executing) are left untouched; returns whether a row moved.
pub async fn complete_job(pool: &PgPool, job_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update jobs
        set status = 'completed',
            updated_at = now()
        where id = $1
          and status = 'running'
        returning id
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
    .context("complete_job failed")?;

    Ok(row.is_some())
}

/// Fail a running job. With `retry_in` the job requeues with a backoff
/// window and a cleared lock; without it the failure is terminal. The
/// `status = 'running'` guard preserves cancellations either way.
pub async fn fail_job(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
    retry_in: Option<Duration>,
) -> Result<bool> {
    let error = truncate(error, 2000);

    let row: Option<(Uuid,)> = match retry_in {
        Some(backoff) => {
            sqlx::query_as(
                r#"
                update jobs
                set status = 'queued',
                    last_error = $2,
                    available_at = now() + $3::interval,
                    locked_at = null,
                    locked_by = null,
                    updated_at = now()
                where id = $1
                  and status = 'running'
                returning id
                "#,
            )
            .bind(job_id)
            .bind(&error)
            .bind(format!("{} seconds", backoff.num_seconds()))
            .fetch_optional(pool)
            .await
        }
        None => {
            sqlx::query_as(
                r#"
                update jobs
                set status = 'failed',
                    last_error = $2,
                    updated_at = now()
                where id = $1
                  and status = 'running'
                returning id
                "#,
            )
            .bind(job_id)
            .bind(&error)
            .fetch_optional(pool)
            .await
        }
    }
    .context("fail_job failed")?;

    Ok(row.is_some())
}

/// Force `cancelled` from any non-terminal state, clearing the lock.
/// Cancelling an already-terminal job is a no-op.
pub async fn cancel_job(pool: &PgPool, job_id: Uuid, reason: Option<&str>) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update jobs
        set status = 'cancelled',
            last_error = coalesce($2, last_error),
            locked_at = null,
            locked_by = null,
            updated_at = now()
        where id = $1
          and status in ('queued', 'running')
        returning id
        "#,
    )
    .bind(job_id)
    .bind(reason.map(|r| truncate(r, 2000)))
    .fetch_optional(pool)
    .await
    .context("cancel_job failed")?;

    Ok(row.is_some())
}

/// Refresh the liveness heartbeat on a running job.
///
/// `recover_stale_jobs` treats a running job whose `locked_at` stopped
/// advancing as abandoned; a worker busy inside a long probe calls this on
/// an interval to stay alive.
pub async fn heartbeat_job(pool: &PgPool, job_id: Uuid, worker_id: &str) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update jobs
        set locked_at = now()
        where id = $1
          and status = 'running'
          and locked_by = $2
        returning id
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("heartbeat_job failed")?;

    Ok(row.is_some())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
