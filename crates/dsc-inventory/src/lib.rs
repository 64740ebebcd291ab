//! The versioned inventory graph: assets, services, edges.
//!
//! Every operation takes an open `PgConnection` supplied by the caller,
//! usually a transaction, and never commits. "Seen" upserts are keyed on
//! the normalized tuple and idempotent: re-observing a row refreshes
//! `last_seen_*`, resurrects non-active rows, and never touches the
//! write-once `first_seen_*` provenance. Status writes (the verifier's
//! conclusions) are separate and never touch `last_seen_*`.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use dsc_scan::{AssetType, Proto, RelType};

pub mod ingest;

pub use ingest::{ingest_scan_result, IngestSummary};

// ---------------------------------------------------------------------------
// Lifecycle status
// ---------------------------------------------------------------------------

/// Lifecycle of an asset or service.
///
/// `stale` is transitional (awaiting verification); `closed` and
/// `unresolved` are the two negative verification outcomes; re-observation
/// returns any of them to `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Active,
    Stale,
    Closed,
    Unresolved,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Active => "active",
            LifecycleStatus::Stale => "stale",
            LifecycleStatus::Closed => "closed",
            LifecycleStatus::Unresolved => "unresolved",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(LifecycleStatus::Active),
            "stale" => Ok(LifecycleStatus::Stale),
            "closed" => Ok(LifecycleStatus::Closed),
            "unresolved" => Ok(LifecycleStatus::Unresolved),
            other => Err(anyhow!("invalid lifecycle status: {}", other)),
        }
    }
}

/// Reason string recorded when a sweep marks a row stale.
pub fn stale_reason(run_id: Uuid) -> String {
    format!("not_seen_in_run:{run_id}")
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AssetRow {
    pub id: Uuid,
    pub target_id: Uuid,
    pub asset_type: AssetType,
    pub value: String,
    pub normalized: String,
    pub first_seen_run_id: Option<Uuid>,
    pub last_seen_run_id: Option<Uuid>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub status: LifecycleStatus,
    pub status_reason: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_run_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ServiceRow {
    pub id: Uuid,
    pub target_id: Uuid,
    pub asset_id: Uuid,
    pub port: i32,
    pub proto: Proto,
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub first_seen_run_id: Option<Uuid>,
    pub last_seen_run_id: Option<Uuid>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub status: LifecycleStatus,
    pub status_reason: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_run_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub id: Uuid,
    pub target_id: Uuid,
    pub from_asset_id: Uuid,
    pub to_asset_id: Uuid,
    pub rel_type: RelType,
    pub first_seen_run_id: Option<Uuid>,
    pub last_seen_run_id: Option<Uuid>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Result of a "seen" upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: Uuid,
    pub created: bool,
}

fn asset_from_row(row: &PgRow) -> Result<AssetRow> {
    Ok(AssetRow {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        asset_type: AssetType::parse(&row.try_get::<String, _>("type")?)?,
        value: row.try_get("value")?,
        normalized: row.try_get("normalized")?,
        first_seen_run_id: row.try_get("first_seen_run_id")?,
        last_seen_run_id: row.try_get("last_seen_run_id")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        status: LifecycleStatus::parse(&row.try_get::<String, _>("status")?)?,
        status_reason: row.try_get("status_reason")?,
        verified_at: row.try_get("verified_at")?,
        verified_run_id: row.try_get("verified_run_id")?,
    })
}

fn service_from_row(row: &PgRow) -> Result<ServiceRow> {
    Ok(ServiceRow {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        asset_id: row.try_get("asset_id")?,
        port: row.try_get("port")?,
        proto: Proto::parse(&row.try_get::<String, _>("proto")?)?,
        name: row.try_get("name")?,
        product: row.try_get("product")?,
        version: row.try_get("version")?,
        first_seen_run_id: row.try_get("first_seen_run_id")?,
        last_seen_run_id: row.try_get("last_seen_run_id")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        status: LifecycleStatus::parse(&row.try_get::<String, _>("status")?)?,
        status_reason: row.try_get("status_reason")?,
        verified_at: row.try_get("verified_at")?,
        verified_run_id: row.try_get("verified_run_id")?,
    })
}

const ASSET_COLUMNS: &str = "id, target_id, type, value, normalized, first_seen_run_id, \
     last_seen_run_id, first_seen_at, last_seen_at, status, status_reason, verified_at, \
     verified_run_id";

const SERVICE_COLUMNS: &str = "id, target_id, asset_id, port, proto, name, product, version, \
     first_seen_run_id, last_seen_run_id, first_seen_at, last_seen_at, status, status_reason, \
     verified_at, verified_run_id";

// ---------------------------------------------------------------------------
// Seen upserts
// ---------------------------------------------------------------------------

/// Record that an asset was observed, deduped by `(target, type, normalized)`.
///
/// Existing rows refresh `value` and `last_seen_*`; a non-active status is
/// resurrected to `active` with the reason cleared. New rows start with
/// `first_seen_* = last_seen_* = (run, seen_at)`.
pub async fn upsert_asset_seen(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Option<Uuid>,
    asset_type: AssetType,
    value: &str,
    normalized: &str,
    seen_at: DateTime<Utc>,
) -> Result<Upserted> {
    let existing: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select id
        from assets
        where target_id = $1 and type = $2 and normalized = $3
        "#,
    )
    .bind(target_id)
    .bind(asset_type.as_str())
    .bind(normalized)
    .fetch_optional(&mut *conn)
    .await
    .context("upsert_asset_seen lookup failed")?;

    if let Some((id,)) = existing {
        sqlx::query(
            r#"
            update assets
            set value = $2,
                last_seen_run_id = $3,
                last_seen_at = $4,
                status = case when status <> 'active' then 'active' else status end,
                status_reason = case when status <> 'active' then null else status_reason end
            where id = $1
            "#,
        )
        .bind(id)
        .bind(value)
        .bind(run_id)
        .bind(seen_at)
        .execute(conn)
        .await
        .context("upsert_asset_seen update failed")?;

        return Ok(Upserted { id, created: false });
    }

    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into assets (
            id, target_id, type, value, normalized,
            first_seen_run_id, last_seen_run_id, first_seen_at, last_seen_at, status
        ) values ($1, $2, $3, $4, $5, $6, $6, $7, $7, 'active')
        returning id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(target_id)
    .bind(asset_type.as_str())
    .bind(value)
    .bind(normalized)
    .bind(run_id)
    .bind(seen_at)
    .fetch_one(conn)
    .await
    .context("upsert_asset_seen insert failed")?;

    Ok(Upserted { id, created: true })
}

/// Record that a service was observed, deduped by
/// `(target, asset, port, proto)`. Same refresh/resurrect semantics as
/// [`upsert_asset_seen`]; `name`/`product`/`version` take the latest
/// observation.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_service_seen(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Option<Uuid>,
    asset_id: Uuid,
    port: i32,
    proto: Proto,
    name: Option<&str>,
    product: Option<&str>,
    version: Option<&str>,
    seen_at: DateTime<Utc>,
) -> Result<Upserted> {
    let existing: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select id
        from services
        where target_id = $1 and asset_id = $2 and port = $3 and proto = $4
        "#,
    )
    .bind(target_id)
    .bind(asset_id)
    .bind(port)
    .bind(proto.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("upsert_service_seen lookup failed")?;

    if let Some((id,)) = existing {
        sqlx::query(
            r#"
            update services
            set name = $2,
                product = $3,
                version = $4,
                last_seen_run_id = $5,
                last_seen_at = $6,
                status = case when status <> 'active' then 'active' else status end,
                status_reason = case when status <> 'active' then null else status_reason end
            where id = $1
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(product)
        .bind(version)
        .bind(run_id)
        .bind(seen_at)
        .execute(conn)
        .await
        .context("upsert_service_seen update failed")?;

        return Ok(Upserted { id, created: false });
    }

    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into services (
            id, target_id, asset_id, port, proto, name, product, version,
            first_seen_run_id, last_seen_run_id, first_seen_at, last_seen_at, status
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, $10, $10, 'active')
        returning id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(target_id)
    .bind(asset_id)
    .bind(port)
    .bind(proto.as_str())
    .bind(name)
    .bind(product)
    .bind(version)
    .bind(run_id)
    .bind(seen_at)
    .fetch_one(conn)
    .await
    .context("upsert_service_seen insert failed")?;

    Ok(Upserted { id, created: true })
}

/// Record that a relationship was observed, deduped by
/// `(target, from, to, rel_type)`. Edges carry no lifecycle status; only
/// provenance refreshes.
pub async fn upsert_edge_seen(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Option<Uuid>,
    from_asset_id: Uuid,
    to_asset_id: Uuid,
    rel_type: RelType,
    seen_at: DateTime<Utc>,
) -> Result<Upserted> {
    let existing: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select id
        from edges
        where target_id = $1 and from_asset_id = $2 and to_asset_id = $3 and rel_type = $4
        "#,
    )
    .bind(target_id)
    .bind(from_asset_id)
    .bind(to_asset_id)
    .bind(rel_type.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("upsert_edge_seen lookup failed")?;

    if let Some((id,)) = existing {
        sqlx::query(
            r#"
            update edges
            set last_seen_run_id = $2,
                last_seen_at = $3
            where id = $1
            "#,
        )
        .bind(id)
        .bind(run_id)
        .bind(seen_at)
        .execute(conn)
        .await
        .context("upsert_edge_seen update failed")?;

        return Ok(Upserted { id, created: false });
    }

    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into edges (
            id, target_id, from_asset_id, to_asset_id, rel_type,
            first_seen_run_id, last_seen_run_id, first_seen_at, last_seen_at
        ) values ($1, $2, $3, $4, $5, $6, $6, $7, $7)
        returning id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(target_id)
    .bind(from_asset_id)
    .bind(to_asset_id)
    .bind(rel_type.as_str())
    .bind(run_id)
    .bind(seen_at)
    .fetch_one(conn)
    .await
    .context("upsert_edge_seen insert failed")?;

    Ok(Upserted { id, created: true })
}

// ---------------------------------------------------------------------------
// Status writes (verifier conclusions)
// ---------------------------------------------------------------------------

/// Direct status write by unique key. Does not touch `last_seen_*`.
/// A missing row is a no-op (the asset may have been purged).
pub async fn set_asset_status(
    conn: &mut PgConnection,
    target_id: Uuid,
    asset_type: AssetType,
    normalized: &str,
    status: LifecycleStatus,
    reason: Option<&str>,
    verified_at: DateTime<Utc>,
    verified_run_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query(
        r#"
        update assets
        set status = $4,
            status_reason = $5,
            verified_at = $6,
            verified_run_id = $7
        where target_id = $1 and type = $2 and normalized = $3
        "#,
    )
    .bind(target_id)
    .bind(asset_type.as_str())
    .bind(normalized)
    .bind(status.as_str())
    .bind(reason)
    .bind(verified_at)
    .bind(verified_run_id)
    .execute(conn)
    .await
    .context("set_asset_status failed")?;
    Ok(())
}

/// Direct status write by service id. Does not touch `last_seen_*`.
pub async fn set_service_status(
    conn: &mut PgConnection,
    service_id: Uuid,
    status: LifecycleStatus,
    reason: Option<&str>,
    verified_at: DateTime<Utc>,
    verified_run_id: Option<Uuid>,
) -> Result<()> {
    sqlx::query(
        r#"
        update services
        set status = $2,
            status_reason = $3,
            verified_at = $4,
            verified_run_id = $5
        where id = $1
        "#,
    )
    .bind(service_id)
    .bind(status.as_str())
    .bind(reason)
    .bind(verified_at)
    .bind(verified_run_id)
    .execute(conn)
    .await
    .context("set_service_status failed")?;
    Ok(())
}

/// A TCP-verified service is both verified and freshly seen: `active`,
/// `last_seen_*` advanced to the verify run, reason cleared.
pub async fn set_service_verified_active(
    conn: &mut PgConnection,
    service_id: Uuid,
    run_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        update services
        set status = 'active',
            status_reason = null,
            last_seen_run_id = $2,
            last_seen_at = now(),
            verified_at = now(),
            verified_run_id = $2
        where id = $1
        "#,
    )
    .bind(service_id)
    .bind(run_id)
    .execute(conn)
    .await
    .context("set_service_verified_active failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sweep marking and diff queries
// ---------------------------------------------------------------------------

/// Mark one asset stale ahead of verification.
pub async fn mark_asset_stale(conn: &mut PgConnection, asset_id: Uuid, reason: &str) -> Result<()> {
    sqlx::query(
        r#"
        update assets
        set status = 'stale',
            status_reason = $2
        where id = $1
        "#,
    )
    .bind(asset_id)
    .bind(reason)
    .execute(conn)
    .await
    .context("mark_asset_stale failed")?;
    Ok(())
}

/// Mark one service stale ahead of verification.
pub async fn mark_service_stale(
    conn: &mut PgConnection,
    service_id: Uuid,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        update services
        set status = 'stale',
            status_reason = $2
        where id = $1
        "#,
    )
    .bind(service_id)
    .bind(reason)
    .execute(conn)
    .await
    .context("mark_service_stale failed")?;
    Ok(())
}

/// Active assets of the given types whose `last_seen_run_id` is set and is
/// not `run_id`: the disappearance candidates for this run's sweep.
pub async fn active_assets_not_seen_in_run(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Uuid,
    asset_types: &[AssetType],
) -> Result<Vec<AssetRow>> {
    let types: Vec<String> = asset_types.iter().map(|t| t.as_str().to_string()).collect();

    let rows = sqlx::query(&format!(
        r#"
        select {ASSET_COLUMNS}
        from assets
        where target_id = $1
          and status = 'active'
          and last_seen_run_id is not null
          and last_seen_run_id <> $2
          and type = any($3)
        order by created_at asc
        "#
    ))
    .bind(target_id)
    .bind(run_id)
    .bind(&types)
    .fetch_all(conn)
    .await
    .context("active_assets_not_seen_in_run failed")?;

    rows.iter().map(asset_from_row).collect()
}

/// Active services not seen in `run_id`. No type filter: every service
/// qualifies for verification.
pub async fn active_services_not_seen_in_run(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Uuid,
) -> Result<Vec<ServiceRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {SERVICE_COLUMNS}
        from services
        where target_id = $1
          and status = 'active'
          and last_seen_run_id is not null
          and last_seen_run_id <> $2
        order by created_at asc
        "#
    ))
    .bind(target_id)
    .bind(run_id)
    .fetch_all(conn)
    .await
    .context("active_services_not_seen_in_run failed")?;

    rows.iter().map(service_from_row).collect()
}

/// Stale rows whose reason points at `run_id`, for manual re-verification.
pub async fn stale_assets_for_run(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Uuid,
    asset_types: &[AssetType],
) -> Result<Vec<AssetRow>> {
    let types: Vec<String> = asset_types.iter().map(|t| t.as_str().to_string()).collect();

    let rows = sqlx::query(&format!(
        r#"
        select {ASSET_COLUMNS}
        from assets
        where target_id = $1
          and status = 'stale'
          and status_reason = $2
          and type = any($3)
        order by created_at asc
        "#
    ))
    .bind(target_id)
    .bind(stale_reason(run_id))
    .bind(&types)
    .fetch_all(conn)
    .await
    .context("stale_assets_for_run failed")?;

    rows.iter().map(asset_from_row).collect()
}

/// Stale services whose reason points at `run_id`.
pub async fn stale_services_for_run(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Uuid,
) -> Result<Vec<ServiceRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {SERVICE_COLUMNS}
        from services
        where target_id = $1
          and status = 'stale'
          and status_reason = $2
        order by created_at asc
        "#
    ))
    .bind(target_id)
    .bind(stale_reason(run_id))
    .fetch_all(conn)
    .await
    .context("stale_services_for_run failed")?;

    rows.iter().map(service_from_row).collect()
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub async fn fetch_asset(conn: &mut PgConnection, asset_id: Uuid) -> Result<Option<AssetRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {ASSET_COLUMNS}
        from assets
        where id = $1
        "#
    ))
    .bind(asset_id)
    .fetch_optional(conn)
    .await
    .context("fetch_asset failed")?;

    row.as_ref().map(asset_from_row).transpose()
}

pub async fn fetch_asset_by_key(
    conn: &mut PgConnection,
    target_id: Uuid,
    asset_type: AssetType,
    normalized: &str,
) -> Result<Option<AssetRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {ASSET_COLUMNS}
        from assets
        where target_id = $1 and type = $2 and normalized = $3
        "#
    ))
    .bind(target_id)
    .bind(asset_type.as_str())
    .bind(normalized)
    .fetch_optional(conn)
    .await
    .context("fetch_asset_by_key failed")?;

    row.as_ref().map(asset_from_row).transpose()
}

pub async fn fetch_service(conn: &mut PgConnection, service_id: Uuid) -> Result<Option<ServiceRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {SERVICE_COLUMNS}
        from services
        where id = $1
        "#
    ))
    .bind(service_id)
    .fetch_optional(conn)
    .await
    .context("fetch_service failed")?;

    row.as_ref().map(service_from_row).transpose()
}

/// Assets for a target, optionally filtered by lifecycle status.
pub async fn list_assets(
    conn: &mut PgConnection,
    target_id: Uuid,
    status: Option<LifecycleStatus>,
) -> Result<Vec<AssetRow>> {
    let rows = match status {
        Some(st) => {
            sqlx::query(&format!(
                r#"
                select {ASSET_COLUMNS}
                from assets
                where target_id = $1 and status = $2
                order by created_at asc
                "#
            ))
            .bind(target_id)
            .bind(st.as_str())
            .fetch_all(conn)
            .await
        }
        None => {
            sqlx::query(&format!(
                r#"
                select {ASSET_COLUMNS}
                from assets
                where target_id = $1
                order by created_at asc
                "#
            ))
            .bind(target_id)
            .fetch_all(conn)
            .await
        }
    }
    .context("list_assets failed")?;

    rows.iter().map(asset_from_row).collect()
}

/// Services for a target, optionally filtered by lifecycle status.
pub async fn list_services(
    conn: &mut PgConnection,
    target_id: Uuid,
    status: Option<LifecycleStatus>,
) -> Result<Vec<ServiceRow>> {
    let rows = match status {
        Some(st) => {
            sqlx::query(&format!(
                r#"
                select {SERVICE_COLUMNS}
                from services
                where target_id = $1 and status = $2
                order by created_at asc
                "#
            ))
            .bind(target_id)
            .bind(st.as_str())
            .fetch_all(conn)
            .await
        }
        None => {
            sqlx::query(&format!(
                r#"
                select {SERVICE_COLUMNS}
                from services
                where target_id = $1
                order by created_at asc
                "#
            ))
            .bind(target_id)
            .fetch_all(conn)
            .await
        }
    }
    .context("list_services failed")?;

    rows.iter().map(service_from_row).collect()
}

/// Intra-batch artifact key used by `ingest` for deduplication.
pub(crate) type AssetKey = (AssetType, String);

pub(crate) fn asset_key(asset_type: AssetType, normalized: &str) -> AssetKey {
    (asset_type, normalized.to_string())
}

/// Shared id cache across one ingest batch.
pub(crate) type AssetIdCache = HashMap<AssetKey, Uuid>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_reason_embeds_run_id() {
        let run = Uuid::new_v4();
        assert_eq!(stale_reason(run), format!("not_seen_in_run:{run}"));
    }

    #[test]
    fn lifecycle_round_trip() {
        for st in [
            LifecycleStatus::Active,
            LifecycleStatus::Stale,
            LifecycleStatus::Closed,
            LifecycleStatus::Unresolved,
        ] {
            assert_eq!(LifecycleStatus::parse(st.as_str()).unwrap(), st);
        }
        assert!(LifecycleStatus::parse("zombie").is_err());
    }
}
