//! Crash recovery for orphaned `running` rows.
//!
//! Two flavours:
//! - [`recover_orphans`] fails everything still `running`, correct when a
//!   single-process deployment restarts (nothing else can be live).
//! - [`recover_stale_jobs`] only touches running jobs whose `locked_at`
//!   heartbeat is older than a threshold, safe with worker replicas where
//!   a blanket recovery would kill live work on peers.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::time::Duration;

pub const RECOVERED_ERROR: &str = "Recovered: server restarted while job was running";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub jobs_failed: u64,
    pub runs_failed: u64,
    pub scans_failed: u64,
}

impl RecoverySummary {
    pub fn total(&self) -> u64 {
        self.jobs_failed + self.runs_failed + self.scans_failed
    }
}

/// Fail every `running` job, run, and scan in one transaction.
///
/// Idempotent: already-terminal rows are untouched, so running this on every
/// startup is safe.
pub async fn recover_orphans(pool: &PgPool) -> Result<RecoverySummary> {
    let mut tx = pool.begin().await.context("recover_orphans begin failed")?;

    let jobs = sqlx::query(
        r#"
        update jobs
        set status = 'failed',
            last_error = $1,
            locked_at = null,
            locked_by = null,
            updated_at = now()
        where status = 'running'
        "#,
    )
    .bind(RECOVERED_ERROR)
    .execute(&mut *tx)
    .await
    .context("recover_orphans jobs failed")?;

    let runs = sqlx::query(
        r#"
        update runs
        set status = 'failed',
            completed_at = now()
        where status = 'running'
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("recover_orphans runs failed")?;

    let scans = sqlx::query(
        r#"
        update scans
        set status = 'failed',
            completed_at = now()
        where status = 'running'
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("recover_orphans scans failed")?;

    tx.commit().await.context("recover_orphans commit failed")?;

    Ok(RecoverySummary {
        jobs_failed: jobs.rows_affected(),
        runs_failed: runs.rows_affected(),
        scans_failed: scans.rows_affected(),
    })
}

/// Fail running jobs whose heartbeat (`locked_at`) is older than `ttl`.
///
/// Workers refresh `locked_at` while executing, so a stale heartbeat means
/// the owning worker died mid-job. Peers with live heartbeats are untouched.
pub async fn recover_stale_jobs(pool: &PgPool, ttl: Duration) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update jobs
        set status = 'failed',
            last_error = $1,
            locked_at = null,
            locked_by = null,
            updated_at = now()
        where status = 'running'
          and locked_at is not null
          and locked_at < now() - ($2::bigint * interval '1 second')
        "#,
    )
    .bind(RECOVERED_ERROR)
    .bind(ttl.as_secs() as i64)
    .execute(pool)
    .await
    .context("recover_stale_jobs failed")?;

    Ok(res.rows_affected())
}
