//! Scan rows: one row per external probe invocation, including the
//! verifier's synthetic probes. Findings hang off scans but survive scan and
//! run deletion (FKs null out).

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Cap stored raw output; scanners can be chatty.
pub const MAX_RAW_OUTPUT: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(anyhow!("invalid scan status: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRow {
    pub id: Uuid,
    pub target_id: Uuid,
    pub run_id: Option<Uuid>,
    pub scanner: String,
    pub target: String,
    pub status: ScanStatus,
    pub config: Option<Value>,
    pub raw_output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn scan_from_row(row: &PgRow) -> Result<ScanRow> {
    Ok(ScanRow {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        run_id: row.try_get("run_id")?,
        scanner: row.try_get("scanner")?,
        target: row.try_get("target")?,
        status: ScanStatus::parse(&row.try_get::<String, _>("status")?)?,
        config: row.try_get("config")?,
        raw_output: row.try_get("raw_output")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const SCAN_COLUMNS: &str = "id, target_id, run_id, scanner, target, status, config, raw_output, \
     error, started_at, completed_at, created_at";

/// Insert a scan in `running` with `started_at = now()`.
pub async fn start_scan(
    pool: &PgPool,
    target_id: Uuid,
    run_id: Option<Uuid>,
    scanner: &str,
    target: &str,
    config: Option<Value>,
) -> Result<ScanRow> {
    let row = sqlx::query(&format!(
        r#"
        insert into scans (id, target_id, run_id, scanner, target, status, config, started_at)
        values ($1, $2, $3, $4, $5, 'running', $6, now())
        returning {SCAN_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(target_id)
    .bind(run_id)
    .bind(scanner)
    .bind(target)
    .bind(config)
    .fetch_one(pool)
    .await
    .context("start_scan failed")?;

    scan_from_row(&row)
}

/// Stamp the terminal status, truncated raw output, and `completed_at`.
pub async fn finish_scan(
    pool: &PgPool,
    scan_id: Uuid,
    status: ScanStatus,
    raw_output: &str,
    error: Option<&str>,
) -> Result<()> {
    let raw: String = raw_output.chars().take(MAX_RAW_OUTPUT).collect();

    sqlx::query(
        r#"
        update scans
        set status = $2,
            raw_output = $3,
            error = $4,
            completed_at = now()
        where id = $1
        "#,
    )
    .bind(scan_id)
    .bind(status.as_str())
    .bind(raw)
    .bind(error)
    .execute(pool)
    .await
    .context("finish_scan failed")?;
    Ok(())
}

pub async fn fetch_scan(pool: &PgPool, scan_id: Uuid) -> Result<Option<ScanRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {SCAN_COLUMNS}
        from scans
        where id = $1
        "#
    ))
    .bind(scan_id)
    .fetch_optional(pool)
    .await
    .context("fetch_scan failed")?;

    row.as_ref().map(scan_from_row).transpose()
}

#[derive(Debug, Clone)]
pub struct NewFinding {
    pub scan_id: Uuid,
    pub target_id: Uuid,
    pub run_id: Option<Uuid>,
    pub asset_id: Option<Uuid>,
    pub severity: String,
    pub title: String,
    pub description: String,
    pub evidence: String,
    pub remediation: String,
    pub url: String,
    pub cve: String,
    pub cvss_score: f64,
}

pub async fn insert_finding(pool: &PgPool, f: &NewFinding) -> Result<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into findings (
            id, scan_id, target_id, run_id, asset_id,
            severity, title, description, evidence, remediation,
            url, cve, cvss_score
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        returning id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(f.scan_id)
    .bind(f.target_id)
    .bind(f.run_id)
    .bind(f.asset_id)
    .bind(&f.severity)
    .bind(&f.title)
    .bind(&f.description)
    .bind(&f.evidence)
    .bind(&f.remediation)
    .bind(&f.url)
    .bind(&f.cve)
    .bind(f.cvss_score)
    .fetch_one(pool)
    .await
    .context("insert_finding failed")?;

    Ok(id)
}
