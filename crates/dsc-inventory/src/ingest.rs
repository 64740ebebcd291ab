//! Batched ingestion of one `ScanResult` into the inventory graph.
//!
//! Within a single batch, artifacts are deduplicated by their key tuples
//! before any database round-trip, and host/url assets referenced by
//! services and edge endpoints are auto-created when the batch itself did
//! not carry them. The caller owns the transaction: all upserts land
//! together on commit.
//!
//! Repeating an ingestion with the same `(target, run, result)` is a no-op
//! beyond refreshing `last_seen_at` timestamps; every upsert is key-stable.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use dsc_scan::{AssetType, Proto, RelType, ScanResult};

use crate::{asset_key, upsert_asset_seen, upsert_edge_seen, upsert_service_seen, AssetIdCache};

/// Counts of rows touched by one ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub assets: usize,
    pub services: usize,
    pub edges: usize,
}

pub async fn ingest_scan_result(
    conn: &mut PgConnection,
    target_id: Uuid,
    run_id: Option<Uuid>,
    result: &ScanResult,
    seen_at: DateTime<Utc>,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    let mut ids = AssetIdCache::new();

    for artifact in &result.assets {
        if artifact.normalized.is_empty() {
            continue;
        }
        let key = asset_key(artifact.asset_type, &artifact.normalized);
        if ids.contains_key(&key) {
            continue;
        }
        let up = upsert_asset_seen(
            conn,
            target_id,
            run_id,
            artifact.asset_type,
            &artifact.value,
            &artifact.normalized,
            seen_at,
        )
        .await?;
        ids.insert(key, up.id);
        summary.assets += 1;
    }

    let mut service_keys: HashSet<(AssetType, String, u16, Proto)> = HashSet::new();
    for svc in &result.services {
        if svc.host_normalized.is_empty() {
            continue;
        }
        let skey = (
            svc.host_type,
            svc.host_normalized.clone(),
            svc.port,
            svc.proto,
        );
        if !service_keys.insert(skey) {
            continue;
        }

        let host_id = resolve_asset_id(
            conn,
            &mut ids,
            target_id,
            run_id,
            svc.host_type,
            &svc.host_value,
            &svc.host_normalized,
            seen_at,
        )
        .await?;

        upsert_service_seen(
            conn,
            target_id,
            run_id,
            host_id,
            i32::from(svc.port),
            svc.proto,
            svc.name.as_deref(),
            svc.product.as_deref(),
            svc.version.as_deref(),
            seen_at,
        )
        .await?;
        summary.services += 1;
    }

    let mut edge_keys: HashSet<(AssetType, String, AssetType, String, RelType)> = HashSet::new();
    for edge in &result.edges {
        if edge.from_normalized.is_empty() || edge.to_normalized.is_empty() {
            continue;
        }
        let ekey = (
            edge.from_type,
            edge.from_normalized.clone(),
            edge.to_type,
            edge.to_normalized.clone(),
            edge.rel_type,
        );
        if !edge_keys.insert(ekey) {
            continue;
        }

        let from_id = resolve_asset_id(
            conn,
            &mut ids,
            target_id,
            run_id,
            edge.from_type,
            &edge.from_value,
            &edge.from_normalized,
            seen_at,
        )
        .await?;
        let to_id = resolve_asset_id(
            conn,
            &mut ids,
            target_id,
            run_id,
            edge.to_type,
            &edge.to_value,
            &edge.to_normalized,
            seen_at,
        )
        .await?;

        upsert_edge_seen(conn, target_id, run_id, from_id, to_id, edge.rel_type, seen_at).await?;
        summary.edges += 1;
    }

    Ok(summary)
}

/// Asset id for an endpoint reference, upserting the underlying asset when
/// the batch did not carry it.
#[allow(clippy::too_many_arguments)]
async fn resolve_asset_id(
    conn: &mut PgConnection,
    ids: &mut AssetIdCache,
    target_id: Uuid,
    run_id: Option<Uuid>,
    asset_type: AssetType,
    value: &str,
    normalized: &str,
    seen_at: DateTime<Utc>,
) -> Result<Uuid> {
    let key = asset_key(asset_type, normalized);
    if let Some(id) = ids.get(&key) {
        return Ok(*id);
    }
    let up = upsert_asset_seen(conn, target_id, run_id, asset_type, value, normalized, seen_at).await?;
    ids.insert(key, up.id);
    Ok(up.id)
}
