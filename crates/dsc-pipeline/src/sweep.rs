//! Differential verification sweep.
//!
//! After the final stage, anything `active` that this run did not re-observe
//! becomes `stale` and gets a verification job. Marking and enqueueing run
//! in one transaction keyed on the run id, so repeating the sweep for the
//! same run re-selects nothing (the rows are no longer `active`).

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use dsc_db::{JobType, NewJob};
use dsc_inventory::{
    active_assets_not_seen_in_run, active_services_not_seen_in_run, mark_asset_stale,
    mark_service_stale, stale_reason,
};
use dsc_scan::AssetType;

/// Which rows the sweep covers.
///
/// The asset side is type-filtered (only subdomains and URLs have a
/// meaningful re-probe), while the service side covers every service
/// regardless of protocol. That asymmetry is deliberate and explicit here
/// rather than buried in two differently-shaped queries.
#[derive(Debug, Clone)]
pub struct SweepPolicy {
    pub asset_types: Vec<AssetType>,
    pub all_services: bool,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            asset_types: vec![AssetType::Subdomain, AssetType::Url],
            all_services: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub assets_marked: usize,
    pub services_marked: usize,
}

/// Mark unseen rows stale and enqueue their verification jobs.
pub async fn sweep_unseen(
    pool: &PgPool,
    target_id: Uuid,
    run_id: Uuid,
    policy: &SweepPolicy,
) -> Result<SweepSummary> {
    let mut tx = pool.begin().await.context("sweep begin failed")?;
    let reason = stale_reason(run_id);
    let mut summary = SweepSummary::default();

    let assets = active_assets_not_seen_in_run(&mut tx, target_id, run_id, &policy.asset_types).await?;
    for asset in &assets {
        mark_asset_stale(&mut tx, asset.id, &reason).await?;
        dsc_db::enqueue_job(
            &mut tx,
            &NewJob {
                job_type: JobType::VerifyAsset,
                target_id,
                run_id: Some(run_id),
                payload: json!({"asset_id": asset.id}),
                available_at: None,
            },
        )
        .await?;
        summary.assets_marked += 1;
    }

    if policy.all_services {
        let services = active_services_not_seen_in_run(&mut tx, target_id, run_id).await?;
        for service in &services {
            mark_service_stale(&mut tx, service.id, &reason).await?;
            dsc_db::enqueue_job(
                &mut tx,
                &NewJob {
                    job_type: JobType::VerifyService,
                    target_id,
                    run_id: Some(run_id),
                    payload: json!({"service_id": service.id}),
                    available_at: None,
                },
            )
            .await?;
            summary.services_marked += 1;
        }
    }

    tx.commit().await.context("sweep commit failed")?;
    Ok(summary)
}

/// Re-enqueue verification for rows still stale from `run_id`'s sweep:
/// the manual "verify this run again" surface.
pub async fn reenqueue_stale_verifications(
    pool: &PgPool,
    target_id: Uuid,
    run_id: Uuid,
    policy: &SweepPolicy,
) -> Result<SweepSummary> {
    let mut tx = pool.begin().await.context("reenqueue begin failed")?;
    let mut summary = SweepSummary::default();

    let assets =
        dsc_inventory::stale_assets_for_run(&mut tx, target_id, run_id, &policy.asset_types).await?;
    for asset in &assets {
        dsc_db::enqueue_job(
            &mut tx,
            &NewJob {
                job_type: JobType::VerifyAsset,
                target_id,
                run_id: Some(run_id),
                payload: json!({"asset_id": asset.id}),
                available_at: None,
            },
        )
        .await?;
        summary.assets_marked += 1;
    }

    if policy.all_services {
        let services = dsc_inventory::stale_services_for_run(&mut tx, target_id, run_id).await?;
        for service in &services {
            dsc_db::enqueue_job(
                &mut tx,
                &NewJob {
                    job_type: JobType::VerifyService,
                    target_id,
                    run_id: Some(run_id),
                    payload: json!({"service_id": service.id}),
                    available_at: None,
                },
            )
            .await?;
            summary.services_marked += 1;
        }
    }

    tx.commit().await.context("reenqueue commit failed")?;
    Ok(summary)
}
