//! Per-artifact re-probing: confirm or refute a disappearance.
//!
//! The sweep marks rows `stale`; a verifier job then re-probes each one and
//! concludes `active`, `closed`, or `unresolved`. A negative conclusion is a
//! normal job completion; only unexpected internal errors fail the job.
//!
//! Probes by artifact kind:
//! - subdomain: DNS re-resolution (any address means alive)
//! - url: HTTP GET, TLS verification off, redirects followed; any HTTP
//!   response (error codes included) means alive
//! - service: TCP connect to `(host, port)`
//!
//! Network failures split on the error text: resolver-style failures
//! (`name or service not known`, …) mean `unresolved`; anything else means
//! `closed`.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use dsc_db::ScanStatus;
use dsc_inventory::LifecycleStatus;
use dsc_normalize::normalize_url;
use dsc_resolve::Resolve;
use dsc_scan::{AssetArtifact, AssetType, EdgeArtifact, RelType, ScanResult};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_REDIRECTS: usize = 10;
const MAX_REASON: usize = 300;

/// Error-text fragments that mean "the name no longer resolves" rather than
/// "the endpoint refused us".
const DNS_ERROR_SUBSTRINGS: [&str; 4] = [
    "name or service not known",
    "temporary failure in name resolution",
    "nodename nor servname",
    "failed to lookup address",
];

/// Conclusion of one verification probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub alive: bool,
    pub status: LifecycleStatus,
    pub reason: String,
}

impl VerifyOutcome {
    fn active(reason: impl Into<String>) -> Self {
        Self {
            alive: true,
            status: LifecycleStatus::Active,
            reason: reason.into(),
        }
    }

    fn dead(status: LifecycleStatus, reason: impl Into<String>) -> Self {
        Self {
            alive: false,
            status,
            reason: truncate(&reason.into(), MAX_REASON),
        }
    }

    fn skipped() -> Self {
        Self {
            alive: true,
            status: LifecycleStatus::Active,
            reason: "skipped".to_string(),
        }
    }
}

pub struct VerifierDeps {
    pub resolver: std::sync::Arc<dyn Resolve>,
    pub http: reqwest::Client,
}

impl VerifierDeps {
    pub fn new(resolver: std::sync::Arc<dyn Resolve>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("build verify http client")?;
        Ok(Self { resolver, http })
    }
}

/// Re-probe one asset. Non-subdomain/url kinds are skipped untouched.
pub async fn verify_asset(
    pool: &PgPool,
    deps: &VerifierDeps,
    asset_id: Uuid,
    target_id: Uuid,
    run_id: Uuid,
) -> Result<VerifyOutcome> {
    let asset = {
        let mut conn = pool.acquire().await?;
        dsc_inventory::fetch_asset(&mut conn, asset_id).await?
    };
    let Some(asset) = asset.filter(|a| a.target_id == target_id) else {
        return Ok(VerifyOutcome::skipped());
    };

    let scan = dsc_db::start_scan(
        pool,
        target_id,
        Some(run_id),
        "verify_asset",
        &asset.value,
        None,
    )
    .await?;

    let probe = async {
        match asset.asset_type {
            AssetType::Subdomain => verify_subdomain(pool, deps, &asset, target_id, run_id).await,
            AssetType::Url => verify_url(pool, deps, &asset, target_id, run_id).await,
            _ => Ok(VerifyOutcome::skipped()),
        }
    };

    match probe.await {
        Ok(outcome) => {
            let line = format!(
                "{} {} -> {} ({})",
                asset.asset_type.as_str(),
                asset.normalized,
                outcome.status.as_str(),
                outcome.reason
            );
            dsc_db::finish_scan(pool, scan.id, ScanStatus::Completed, &line, None).await?;
            Ok(outcome)
        }
        Err(e) => {
            let line = format!("error: {e}");
            dsc_db::finish_scan(pool, scan.id, ScanStatus::Failed, &line, Some(&line)).await?;
            Err(e)
        }
    }
}

/// Re-probe one service via TCP connect.
pub async fn verify_service(
    pool: &PgPool,
    _deps: &VerifierDeps,
    service_id: Uuid,
    target_id: Uuid,
    run_id: Uuid,
) -> Result<VerifyOutcome> {
    let (service, host) = {
        let mut conn = pool.acquire().await?;
        let Some(service) = dsc_inventory::fetch_service(&mut conn, service_id)
            .await?
            .filter(|s| s.target_id == target_id)
        else {
            return Ok(VerifyOutcome::skipped());
        };
        let host = dsc_inventory::fetch_asset(&mut conn, service.asset_id)
            .await?
            .map(|a| a.normalized)
            .unwrap_or_default();
        (service, host)
    };

    let scan_target = format!("{host}:{}/{}", service.port, service.proto.as_str());
    let scan = dsc_db::start_scan(
        pool,
        target_id,
        Some(run_id),
        "verify_service",
        &scan_target,
        None,
    )
    .await?;

    let probe = async {
        let outcome = tcp_probe(&host, service.port as u16).await;

        let mut conn = pool.acquire().await?;
        if outcome.alive {
            dsc_inventory::set_service_verified_active(&mut conn, service.id, run_id).await?;
        } else {
            dsc_inventory::set_service_status(
                &mut conn,
                service.id,
                outcome.status,
                Some(&outcome.reason),
                Utc::now(),
                Some(run_id),
            )
            .await?;
        }
        Ok::<VerifyOutcome, anyhow::Error>(outcome)
    };

    match probe.await {
        Ok(outcome) => {
            let line = format!(
                "{scan_target} -> {} ({})",
                outcome.status.as_str(),
                outcome.reason
            );
            dsc_db::finish_scan(pool, scan.id, ScanStatus::Completed, &line, None).await?;
            Ok(outcome)
        }
        Err(e) => {
            let line = format!("error: {e}");
            dsc_db::finish_scan(pool, scan.id, ScanStatus::Failed, &line, Some(&line)).await?;
            Err(e)
        }
    }
}

async fn verify_subdomain(
    pool: &PgPool,
    deps: &VerifierDeps,
    asset: &dsc_inventory::AssetRow,
    target_id: Uuid,
    run_id: Uuid,
) -> Result<VerifyOutcome> {
    let name = asset.normalized.clone();
    let outcome = deps.resolver.resolve_one(&name).await;

    if outcome.ips.is_empty() {
        let code = outcome
            .error
            .map(|e| e.code())
            .unwrap_or_else(|| "NO_ANSWER".to_string());
        let mut conn = pool.acquire().await?;
        dsc_inventory::set_asset_status(
            &mut conn,
            target_id,
            AssetType::Subdomain,
            &name,
            LifecycleStatus::Unresolved,
            Some(&code),
            Utc::now(),
            Some(run_id),
        )
        .await?;
        return Ok(VerifyOutcome::dead(LifecycleStatus::Unresolved, code));
    }

    // Alive: re-ingest the name, its addresses, and resolves_to edges, then
    // stamp the verification.
    let mut result = ScanResult::started("verify_dns", &name);
    result
        .assets
        .push(AssetArtifact::new(AssetType::Subdomain, &asset.value, &name));
    for ip in &outcome.ips {
        if !dsc_normalize::is_ip(ip) {
            continue;
        }
        result
            .assets
            .push(AssetArtifact::new(AssetType::Ip, ip, ip.clone()));
        result.edges.push(EdgeArtifact {
            from_type: AssetType::Subdomain,
            from_value: asset.value.clone(),
            from_normalized: name.clone(),
            to_type: AssetType::Ip,
            to_value: ip.clone(),
            to_normalized: ip.clone(),
            rel_type: RelType::ResolvesTo,
        });
    }

    let mut tx = pool.begin().await.context("verify_subdomain begin")?;
    dsc_inventory::ingest_scan_result(&mut tx, target_id, Some(run_id), &result, Utc::now()).await?;
    dsc_inventory::set_asset_status(
        &mut tx,
        target_id,
        AssetType::Subdomain,
        &name,
        LifecycleStatus::Active,
        None,
        Utc::now(),
        Some(run_id),
    )
    .await?;
    tx.commit().await.context("verify_subdomain commit")?;

    Ok(VerifyOutcome::active("dns_resolved"))
}

async fn verify_url(
    pool: &PgPool,
    deps: &VerifierDeps,
    asset: &dsc_inventory::AssetRow,
    target_id: Uuid,
    run_id: Uuid,
) -> Result<VerifyOutcome> {
    let url = if asset.normalized.is_empty() {
        normalize_url(&asset.value)
    } else {
        asset.normalized.clone()
    };
    if url.is_empty() {
        return Ok(VerifyOutcome::dead(
            LifecycleStatus::Unresolved,
            "invalid_url",
        ));
    }

    match deps.http.get(&url).send().await {
        Ok(resp) => {
            // Any HTTP response counts as alive, error codes included.
            let reason = format!("http:{}", resp.status().as_u16());
            let mut tx = pool.begin().await.context("verify_url begin")?;
            dsc_inventory::upsert_asset_seen(
                &mut tx,
                target_id,
                Some(run_id),
                AssetType::Url,
                &asset.value,
                &url,
                Utc::now(),
            )
            .await?;
            dsc_inventory::set_asset_status(
                &mut tx,
                target_id,
                AssetType::Url,
                &url,
                LifecycleStatus::Active,
                Some(&reason),
                Utc::now(),
                Some(run_id),
            )
            .await?;
            tx.commit().await.context("verify_url commit")?;
            Ok(VerifyOutcome::active(reason))
        }
        Err(e) => {
            // reqwest's Display hides the cause chain; classification needs
            // the underlying resolver text.
            let msg = error_chain_text(&e);
            let status = classify_network_error(&msg);
            let mut conn = pool.acquire().await?;
            dsc_inventory::set_asset_status(
                &mut conn,
                target_id,
                AssetType::Url,
                &url,
                status,
                Some(&truncate(&msg, MAX_REASON)),
                Utc::now(),
                Some(run_id),
            )
            .await?;
            Ok(VerifyOutcome::dead(status, msg))
        }
    }
}

async fn tcp_probe(host: &str, port: u16) -> VerifyOutcome {
    if host.is_empty() {
        return VerifyOutcome::dead(LifecycleStatus::Unresolved, "missing_host");
    }

    match tokio::time::timeout(TCP_TIMEOUT, tokio::net::TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            VerifyOutcome::active("tcp_connect_ok")
        }
        Ok(Err(e)) => {
            let msg = e.to_string();
            VerifyOutcome::dead(classify_network_error(&msg), msg)
        }
        Err(_) => VerifyOutcome::dead(
            LifecycleStatus::Closed,
            format!("tcp connect timeout after {}s", TCP_TIMEOUT.as_secs()),
        ),
    }
}

/// Flatten an error and its sources into one searchable line.
fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}

/// `unresolved` for resolver-style failures, `closed` for everything else.
fn classify_network_error(message: &str) -> LifecycleStatus {
    let lower = message.to_ascii_lowercase();
    if DNS_ERROR_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        LifecycleStatus::Unresolved
    } else {
        LifecycleStatus::Closed
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_failures_classify_as_unresolved() {
        for msg in [
            "failed to lookup address information: Name or service not known",
            "Temporary failure in name resolution",
            "nodename nor servname provided, or not known",
        ] {
            assert_eq!(classify_network_error(msg), LifecycleStatus::Unresolved);
        }
    }

    #[test]
    fn other_failures_classify_as_closed() {
        for msg in ["connection refused", "connection reset by peer", "tls handshake"] {
            assert_eq!(classify_network_error(msg), LifecycleStatus::Closed);
        }
    }

    #[test]
    fn outcome_reasons_are_bounded() {
        let long = "x".repeat(1000);
        let out = VerifyOutcome::dead(LifecycleStatus::Closed, long);
        assert_eq!(out.reason.len(), MAX_REASON);
    }
}
