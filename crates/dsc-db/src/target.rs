//! Target rows: the root of every scope, run, and inventory record.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TargetRow {
    pub id: Uuid,
    pub name: String,
    pub root_domain: String,
    pub scope: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn target_from_row(row: &PgRow) -> Result<TargetRow> {
    Ok(TargetRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        root_domain: row.try_get("root_domain")?,
        scope: row.try_get("scope")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const TARGET_COLUMNS: &str = "id, name, root_domain, scope, created_at, updated_at";

/// Insert a target. `root_domain` must already be normalized (lower-case,
/// no scheme); it is immutable after creation.
pub async fn create_target(
    pool: &PgPool,
    name: &str,
    root_domain: &str,
    scope: Option<Value>,
) -> Result<TargetRow> {
    let row = sqlx::query(&format!(
        r#"
        insert into targets (id, name, root_domain, scope)
        values ($1, $2, $3, $4)
        returning {TARGET_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(root_domain)
    .bind(scope)
    .fetch_one(pool)
    .await
    .context("create_target failed")?;

    target_from_row(&row)
}

pub async fn fetch_target(pool: &PgPool, id: Uuid) -> Result<Option<TargetRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {TARGET_COLUMNS}
        from targets
        where id = $1
        "#
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("fetch_target failed")?;

    row.as_ref().map(target_from_row).transpose()
}

/// Look up by unique root domain, creating on first sight.
pub async fn get_or_create_target(
    pool: &PgPool,
    root_domain: &str,
    name: Option<&str>,
    scope: Option<Value>,
) -> Result<TargetRow> {
    let existing = sqlx::query(&format!(
        r#"
        select {TARGET_COLUMNS}
        from targets
        where root_domain = $1
        "#
    ))
    .bind(root_domain)
    .fetch_optional(pool)
    .await
    .context("get_or_create_target lookup failed")?;

    if let Some(row) = existing {
        return target_from_row(&row);
    }

    create_target(pool, name.unwrap_or(root_domain), root_domain, scope).await
}

pub async fn list_targets(pool: &PgPool) -> Result<Vec<TargetRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {TARGET_COLUMNS}
        from targets
        order by created_at asc
        "#
    ))
    .fetch_all(pool)
    .await
    .context("list_targets failed")?;

    rows.iter().map(target_from_row).collect()
}
