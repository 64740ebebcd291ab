//! The reconnaissance pipeline: a staged fan-out over external probes whose
//! artifacts are upserted into the inventory graph, followed by the
//! differential verification sweep.
//!
//! Stages run strictly in order; each stage's outputs feed the next. Between
//! stages (and between per-host port scans) the run's status is re-read: a
//! run discarded or cancelled from outside raises [`Cancelled`], which the
//! worker translates into `cancel_job` while preserving the run's terminal
//! status. Within a stage there is no cancellation; each stage is one
//! external probe.
//!
//! A failed probe is an empty observation, not an abort: the scan row
//! records the failure and the pipeline continues.

use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use dsc_audit::event_type;
use dsc_db::{RunStatus, RunTrigger, ScanStatus};
use dsc_inventory::{ingest_scan_result, LifecycleStatus};
use dsc_normalize::{is_ip, normalize_url};
use dsc_resolve::Resolve;
use dsc_scan::{
    AssetArtifact, AssetType, EdgeArtifact, RelType, ScanConfig, ScanResult, Scanner,
    ServiceArtifact,
};
use dsc_scope::{domain_in_scope, parse_scope, ScopeConfig};

pub mod sweep;

pub use sweep::{reenqueue_stale_verifications, sweep_unseen, SweepPolicy, SweepSummary};

pub const WEB_PORTS_HTTP: [u16; 9] = [80, 8080, 8000, 3000, 5000, 8081, 8888, 9000, 10000];
pub const WEB_PORTS_HTTPS: [u16; 3] = [443, 8443, 9443];

const ACTOR_WORKER: &str = "worker";

/// Raised when a stage boundary observes the run in `discarded`/`cancelled`.
/// Carries the run's status so callers can preserve it.
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub run_id: Uuid,
    pub status: RunStatus,
}

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {} is {}", self.run_id, self.status.as_str())
    }
}

impl std::error::Error for Cancelled {}

/// Per-invocation limits, payload-driven with scope fallback.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub max_hosts: usize,
    pub max_http_targets: usize,
}

impl PipelineOptions {
    pub fn from_payload(payload: Option<&Value>, scope: &ScopeConfig) -> Self {
        let get = |key: &str| {
            payload
                .and_then(|p| p.get(key))
                .and_then(Value::as_u64)
                .map(|v| v as usize)
        };
        Self {
            max_hosts: get("max_hosts").unwrap_or(scope.max_hosts),
            max_http_targets: get("max_http_targets").unwrap_or(scope.max_http_targets),
        }
    }
}

/// The four probe seats of the pipeline. Production wires the subprocess
/// adapters; tests wire scripted stubs.
pub struct PipelineScanners {
    pub subdomain: Box<dyn Scanner>,
    pub port_scan: Box<dyn Scanner>,
    pub http_probe: Box<dyn Scanner>,
    pub vuln_probe: Box<dyn Scanner>,
}

pub struct PipelineDeps {
    pub scanners: PipelineScanners,
    pub resolver: std::sync::Arc<dyn Resolve>,
}

/// Execute the full pipeline for `target_id` and return the run id.
///
/// When `run_id` is given the existing queued run transitions to running;
/// otherwise a fresh run is created. Cancellation unwinds with [`Cancelled`];
/// any other failure marks the run `failed` before propagating.
pub async fn run_pipeline(
    pool: &PgPool,
    deps: &PipelineDeps,
    target_id: Uuid,
    run_id: Option<Uuid>,
    trigger: RunTrigger,
    payload: Option<&Value>,
) -> Result<Uuid> {
    let target = dsc_db::fetch_target(pool, target_id)
        .await?
        .ok_or_else(|| anyhow!("target {target_id} not found"))?;
    let scope = parse_scope(target.scope.as_ref(), &target.root_domain);
    let options = PipelineOptions::from_payload(payload, &scope);

    let run_id = start_run(pool, target_id, run_id, trigger).await?;

    match execute_stages(pool, deps, &target.root_domain, target_id, run_id, &scope, options).await
    {
        Ok(()) => Ok(run_id),
        Err(err) => {
            if err.downcast_ref::<Cancelled>().is_some() {
                // The discard path already holds the terminal status.
                dsc_db::stamp_run_completed_at(pool, run_id).await?;
            } else {
                dsc_db::mark_run_failed(pool, run_id).await?;
            }
            Err(err)
        }
    }
}

async fn start_run(
    pool: &PgPool,
    target_id: Uuid,
    run_id: Option<Uuid>,
    trigger: RunTrigger,
) -> Result<Uuid> {
    let run_id = match run_id {
        Some(id) => {
            let run = dsc_db::fetch_run(pool, id)
                .await?
                .ok_or_else(|| anyhow!("run {id} not found"))?;
            if run.target_id != target_id {
                return Err(anyhow!("run {id} does not belong to target {target_id}"));
            }
            // Honor a discard that landed before we started.
            if matches!(run.status, RunStatus::Discarded | RunStatus::Cancelled) {
                return Err(Cancelled {
                    run_id: id,
                    status: run.status,
                }
                .into());
            }
            id
        }
        None => {
            let mut conn = pool.acquire().await?;
            dsc_db::create_run(&mut conn, target_id, trigger).await?.id
        }
    };

    dsc_db::mark_run_running(pool, run_id).await?;
    Ok(run_id)
}

async fn execute_stages(
    pool: &PgPool,
    deps: &PipelineDeps,
    root_domain: &str,
    target_id: Uuid,
    run_id: Uuid,
    scope: &ScopeConfig,
    options: PipelineOptions,
) -> Result<()> {
    {
        let mut conn = pool.acquire().await?;
        dsc_audit::log_event(
            &mut conn,
            target_id,
            Some(run_id),
            event_type::PIPELINE_STARTED,
            Some(json!({
                "max_hosts": options.max_hosts,
                "max_http_targets": options.max_http_targets,
            })),
            ACTOR_WORKER,
        )
        .await?;
    }

    ensure_run_live(pool, run_id).await?;

    // 1) Subdomain enumeration, filtered through scope.
    let sub_result = run_scanner_and_persist(
        pool,
        target_id,
        run_id,
        deps.scanners.subdomain.as_ref(),
        root_domain,
        &ScanConfig::default(),
        false,
    )
    .await?;

    let subdomains: Vec<String> = sub_result
        .assets
        .iter()
        .filter(|a| a.asset_type == AssetType::Subdomain && !a.normalized.is_empty())
        .filter(|a| domain_in_scope(scope, &a.normalized))
        .map(|a| a.normalized.clone())
        .collect();

    ensure_run_live(pool, run_id).await?;

    // 2) DNS resolution: subdomain → ip assets + resolves_to edges.
    let resolved_ips = resolve_stage(pool, deps, target_id, run_id, root_domain, &subdomains).await?;

    ensure_run_live(pool, run_id).await?;

    // 3) Port scan over the deduplicated IP list, bounded by max_hosts.
    let mut unique_ips: Vec<String> = Vec::new();
    let mut seen_ips: HashSet<String> = HashSet::new();
    for ip in resolved_ips {
        if seen_ips.insert(ip.clone()) {
            unique_ips.push(ip);
        }
    }
    unique_ips.truncate(options.max_hosts);

    let mut discovered_services: Vec<ServiceArtifact> = Vec::new();
    for ip in &unique_ips {
        ensure_run_live(pool, run_id).await?;
        let scan = run_scanner_and_persist(
            pool,
            target_id,
            run_id,
            deps.scanners.port_scan.as_ref(),
            ip,
            &ScanConfig::default(),
            false,
        )
        .await?;
        discovered_services.extend(scan.services);
    }

    ensure_run_live(pool, run_id).await?;

    // 4) HTTP probe over web-port services.
    let mut http_targets = build_http_targets(&discovered_services);
    http_targets.truncate(options.max_http_targets);

    let mut live_urls: Vec<String> = Vec::new();
    if !http_targets.is_empty() {
        let config = ScanConfig {
            targets: http_targets,
            ..Default::default()
        };
        let http_result = run_scanner_and_persist(
            pool,
            target_id,
            run_id,
            deps.scanners.http_probe.as_ref(),
            root_domain,
            &config,
            false,
        )
        .await?;
        for a in &http_result.assets {
            if a.asset_type == AssetType::Url && !a.normalized.is_empty() {
                live_urls.push(a.normalized.clone());
            }
        }
    }

    ensure_run_live(pool, run_id).await?;

    // 5) Vulnerability probe over the live URLs, one batch.
    if !live_urls.is_empty() {
        let config = ScanConfig {
            targets: live_urls,
            ..Default::default()
        };
        run_scanner_and_persist(
            pool,
            target_id,
            run_id,
            deps.scanners.vuln_probe.as_ref(),
            root_domain,
            &config,
            true,
        )
        .await?;
    }

    ensure_run_live(pool, run_id).await?;

    // Differential verification sweep, then the run completes.
    let summary = sweep_unseen(pool, target_id, run_id, &SweepPolicy::default()).await?;
    info!(
        run_id = %run_id,
        assets_stale = summary.assets_marked,
        services_stale = summary.services_marked,
        "verification sweep finished"
    );

    let mut conn = pool.acquire().await?;
    dsc_db::mark_run_completed(&mut conn, run_id).await?;
    dsc_audit::log_event(
        &mut conn,
        target_id,
        Some(run_id),
        event_type::PIPELINE_COMPLETED,
        None,
        ACTOR_WORKER,
    )
    .await?;

    Ok(())
}

/// Re-read run status; `discarded`/`cancelled` unwinds via [`Cancelled`].
async fn ensure_run_live(pool: &PgPool, run_id: Uuid) -> Result<()> {
    match dsc_db::run_status(pool, run_id).await? {
        Some(status @ (RunStatus::Discarded | RunStatus::Cancelled)) => {
            Err(Cancelled { run_id, status }.into())
        }
        Some(_) => Ok(()),
        None => Err(anyhow!("run {run_id} disappeared mid-pipeline")),
    }
}

/// Stage 2: resolve the kept subdomains, ingest assets/edges, and mark
/// unresolved names. Returns every resolved IP (duplicates included).
async fn resolve_stage(
    pool: &PgPool,
    deps: &PipelineDeps,
    target_id: Uuid,
    run_id: Uuid,
    root_domain: &str,
    subdomains: &[String],
) -> Result<Vec<String>> {
    let scan_row = dsc_db::start_scan(
        pool,
        target_id,
        Some(run_id),
        "dns_resolve",
        root_domain,
        Some(json!({"count": subdomains.len()})),
    )
    .await?;

    let outcomes = deps
        .resolver
        .resolve_many(subdomains, dsc_resolve::DEFAULT_CONCURRENCY)
        .await?;

    let mut result = ScanResult::started("dns_resolve", root_domain);
    let mut raw_lines: Vec<String> = Vec::new();
    let mut unresolved: Vec<(String, String)> = Vec::new();
    let mut resolved_ips: Vec<String> = Vec::new();

    for outcome in &outcomes {
        let name = outcome.name.clone();
        result
            .assets
            .push(AssetArtifact::new(AssetType::Subdomain, &name, &name));

        if outcome.ips.is_empty() {
            let code = outcome
                .error
                .as_ref()
                .map(|e| e.code())
                .unwrap_or_else(|| "NO_ANSWER".to_string());
            raw_lines.push(format!("{name} -> unresolved ({code})"));
            unresolved.push((name, code));
            continue;
        }

        for ip in &outcome.ips {
            if !is_ip(ip) {
                continue;
            }
            resolved_ips.push(ip.clone());
            result
                .assets
                .push(AssetArtifact::new(AssetType::Ip, ip, ip.clone()));
            result.edges.push(EdgeArtifact {
                from_type: AssetType::Subdomain,
                from_value: name.clone(),
                from_normalized: name.clone(),
                to_type: AssetType::Ip,
                to_value: ip.clone(),
                to_normalized: ip.clone(),
                rel_type: RelType::ResolvesTo,
            });
        }
        raw_lines.push(format!("{name} -> {}", outcome.ips.join(", ")));
    }

    dsc_db::finish_scan(
        pool,
        scan_row.id,
        ScanStatus::Completed,
        &raw_lines.join("\n"),
        None,
    )
    .await?;

    let mut tx = pool.begin().await.context("resolve_stage ingest begin")?;
    ingest_scan_result(&mut tx, target_id, Some(run_id), &result, Utc::now()).await?;

    // Names that did not resolve are recorded immediately; they are not
    // candidates for this run's verification sweep.
    for (name, code) in &unresolved {
        dsc_inventory::set_asset_status(
            &mut tx,
            target_id,
            AssetType::Subdomain,
            name,
            LifecycleStatus::Unresolved,
            Some(code),
            Utc::now(),
            None,
        )
        .await?;
    }
    tx.commit().await.context("resolve_stage ingest commit")?;

    Ok(resolved_ips)
}

/// Run one probe: scan row, audit events, artifact ingestion, findings.
async fn run_scanner_and_persist(
    pool: &PgPool,
    target_id: Uuid,
    run_id: Uuid,
    scanner: &dyn Scanner,
    target: &str,
    config: &ScanConfig,
    link_findings_to_url_assets: bool,
) -> Result<ScanResult> {
    let scan_row = dsc_db::start_scan(
        pool,
        target_id,
        Some(run_id),
        scanner.name(),
        target,
        Some(json!({"targets": config.targets, "ports": config.ports})),
    )
    .await?;

    {
        let mut conn = pool.acquire().await?;
        dsc_audit::log_event(
            &mut conn,
            target_id,
            Some(run_id),
            event_type::SCAN_STARTED,
            Some(json!({"scanner": scanner.name(), "target": target})),
            ACTOR_WORKER,
        )
        .await?;
    }

    let result = scanner.run(target, config, None).await;

    let status = match result.status {
        dsc_scan::ScanOutcome::Completed => ScanStatus::Completed,
        dsc_scan::ScanOutcome::Failed => ScanStatus::Failed,
    };
    if status == ScanStatus::Failed {
        warn!(
            scanner = scanner.name(),
            target = target,
            error = result.error.as_deref().unwrap_or(""),
            "probe failed; continuing with empty observation"
        );
    }
    dsc_db::finish_scan(
        pool,
        scan_row.id,
        status,
        &result.raw_output,
        result.error.as_deref(),
    )
    .await?;

    {
        let mut conn = pool.acquire().await?;
        dsc_audit::log_event(
            &mut conn,
            target_id,
            Some(run_id),
            event_type::SCAN_COMPLETED,
            Some(json!({
                "scanner": scanner.name(),
                "target": target,
                "status": status.as_str(),
                "findings": result.findings.len(),
            })),
            ACTOR_WORKER,
        )
        .await?;
    }

    let mut tx = pool.begin().await.context("scanner ingest begin")?;
    ingest_scan_result(&mut tx, target_id, Some(run_id), &result, Utc::now()).await?;

    // Findings are persisted after ingest so URL links can resolve against
    // rows the same batch created.
    let mut finding_asset_ids: Vec<Option<Uuid>> = Vec::with_capacity(result.findings.len());
    for finding in &result.findings {
        let asset_id = if link_findings_to_url_assets && !finding.url.is_empty() {
            let url_norm = normalize_url(&finding.url);
            if url_norm.is_empty() {
                None
            } else {
                match dsc_inventory::fetch_asset_by_key(&mut tx, target_id, AssetType::Url, &url_norm)
                    .await?
                {
                    Some(asset) => Some(asset.id),
                    None => {
                        let up = dsc_inventory::upsert_asset_seen(
                            &mut tx,
                            target_id,
                            Some(run_id),
                            AssetType::Url,
                            &finding.url,
                            &url_norm,
                            Utc::now(),
                        )
                        .await?;
                        Some(up.id)
                    }
                }
            }
        } else {
            None
        };
        finding_asset_ids.push(asset_id);
    }
    tx.commit().await.context("scanner ingest commit")?;

    for (finding, asset_id) in result.findings.iter().zip(finding_asset_ids) {
        dsc_db::insert_finding(
            pool,
            &dsc_db::NewFinding {
                scan_id: scan_row.id,
                target_id,
                run_id: Some(run_id),
                asset_id,
                severity: finding.severity.clone(),
                title: finding.title.clone(),
                description: finding.description.clone(),
                evidence: finding.evidence.clone(),
                remediation: finding.remediation.clone(),
                url: finding.url.clone(),
                cve: finding.cve.clone(),
                cvss_score: finding.cvss_score,
            },
        )
        .await?;
    }

    Ok(result)
}

/// Stage 4 input: candidate URLs for services listening on web ports.
/// Deduplicated by normalized URL, order-preserving; non-TCP services and
/// non-web ports are skipped. The default port is omitted from the literal.
pub fn build_http_targets(services: &[ServiceArtifact]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for svc in services {
        if svc.proto != dsc_scan::Proto::Tcp || svc.host_normalized.is_empty() {
            continue;
        }
        let host = &svc.host_normalized;

        let url = if WEB_PORTS_HTTPS.contains(&svc.port) {
            format!("https://{host}:{}", svc.port)
        } else if WEB_PORTS_HTTP.contains(&svc.port) {
            if svc.port == 80 {
                format!("http://{host}")
            } else {
                format!("http://{host}:{}", svc.port)
            }
        } else {
            continue;
        };

        let norm = normalize_url(&url);
        if norm.is_empty() || !seen.insert(norm.clone()) {
            continue;
        }
        out.push(norm);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_scan::Proto;

    fn svc(host: &str, port: u16, proto: Proto) -> ServiceArtifact {
        ServiceArtifact {
            host_type: AssetType::Ip,
            host_value: host.to_string(),
            host_normalized: host.to_string(),
            port,
            proto,
            name: None,
            product: None,
            version: None,
        }
    }

    #[test]
    fn http_targets_cover_web_ports_only() {
        let services = vec![
            svc("1.2.3.4", 80, Proto::Tcp),
            svc("1.2.3.4", 443, Proto::Tcp),
            svc("1.2.3.4", 22, Proto::Tcp),
            svc("1.2.3.4", 8080, Proto::Tcp),
        ];
        let targets = build_http_targets(&services);
        assert_eq!(
            targets,
            vec![
                "http://1.2.3.4/",
                "https://1.2.3.4/",
                "http://1.2.3.4:8080/",
            ]
        );
    }

    #[test]
    fn http_targets_skip_udp_and_dedupe() {
        let services = vec![
            svc("1.2.3.4", 80, Proto::Udp),
            svc("1.2.3.4", 8443, Proto::Tcp),
            svc("1.2.3.4", 8443, Proto::Tcp),
        ];
        let targets = build_http_targets(&services);
        assert_eq!(targets, vec!["https://1.2.3.4:8443/"]);
    }

    #[test]
    fn options_prefer_payload_over_scope() {
        let scope = dsc_scope::parse_scope(None, "acme.test");
        let payload = json!({"max_hosts": 3, "max_http_targets": 7});
        let opts = PipelineOptions::from_payload(Some(&payload), &scope);
        assert_eq!(opts.max_hosts, 3);
        assert_eq!(opts.max_http_targets, 7);

        let opts = PipelineOptions::from_payload(None, &scope);
        assert_eq!(opts.max_hosts, 50);
        assert_eq!(opts.max_http_targets, 200);
    }

    #[test]
    fn cancelled_displays_run_state() {
        let c = Cancelled {
            run_id: Uuid::nil(),
            status: RunStatus::Discarded,
        };
        assert!(c.to_string().contains("discarded"));
    }
}
