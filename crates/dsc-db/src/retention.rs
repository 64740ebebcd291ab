//! Retention sweep: bound the growth of raw probe output and historical runs.
//!
//! Findings are deliberately not purged; they reference `target_id`
//! independently and survive scan/run deletion through nulling FKs.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

use dsc_config::Settings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub raw_output_cleared: u64,
    pub scans_deleted: u64,
    pub runs_deleted: u64,
}

impl RetentionSummary {
    pub fn total(&self) -> u64 {
        self.raw_output_cleared + self.scans_deleted + self.runs_deleted
    }
}

/// Apply the retention policy:
/// - null `raw_output` on scans completed more than `retention_raw_output_days` ago
/// - delete scans completed more than `retention_completed_runs_days` ago
/// - delete terminal runs completed more than `retention_completed_runs_days` ago
pub async fn purge_old_data(pool: &PgPool, settings: &Settings) -> Result<RetentionSummary> {
    let mut tx = pool.begin().await.context("purge_old_data begin failed")?;

    let cleared = sqlx::query(
        r#"
        update scans
        set raw_output = null
        where completed_at is not null
          and completed_at < now() - ($1::bigint * interval '1 day')
          and raw_output is not null
        "#,
    )
    .bind(settings.retention_raw_output_days)
    .execute(&mut *tx)
    .await
    .context("purge_old_data raw_output clear failed")?;

    let scans = sqlx::query(
        r#"
        delete from scans
        where completed_at is not null
          and completed_at < now() - ($1::bigint * interval '1 day')
        "#,
    )
    .bind(settings.retention_completed_runs_days)
    .execute(&mut *tx)
    .await
    .context("purge_old_data scan delete failed")?;

    let runs = sqlx::query(
        r#"
        delete from runs
        where status in ('completed', 'failed', 'discarded', 'cancelled')
          and completed_at is not null
          and completed_at < now() - ($1::bigint * interval '1 day')
        "#,
    )
    .bind(settings.retention_completed_runs_days)
    .execute(&mut *tx)
    .await
    .context("purge_old_data run delete failed")?;

    tx.commit().await.context("purge_old_data commit failed")?;

    let summary = RetentionSummary {
        raw_output_cleared: cleared.rows_affected(),
        scans_deleted: scans.rows_affected(),
        runs_deleted: runs.rows_affected(),
    };

    if summary.total() > 0 {
        info!(
            raw_output_cleared = summary.raw_output_cleared,
            scans_deleted = summary.scans_deleted,
            runs_deleted = summary.runs_deleted,
            "retention purge completed"
        );
    }

    Ok(summary)
}
