//! Axum router and all HTTP handlers for dsc-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are thin projections over the core crates;
//! no state machine decisions happen here.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use dsc_audit::event_type;
use dsc_db::{JobType, NewJob, RunTrigger};
use dsc_inventory::LifecycleStatus;
use dsc_normalize::normalize_domain;
use dsc_pipeline::SweepPolicy;
use dsc_scope::{domain_in_scope, parse_scope};

use crate::api_types::*;
use crate::state::AppState;

const ACTOR_USER: &str = "user";

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) enum ApiError {
    NotFound(&'static str),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError::Internal(err.into())
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/targets", post(create_target).get(list_targets))
        .route("/api/targets/:target_id/pipeline", post(start_pipeline))
        .route("/api/targets/:target_id/schedules", post(create_schedule).get(list_schedules))
        .route("/api/targets/:target_id/assets", get(list_assets))
        .route("/api/targets/:target_id/services", get(list_services))
        .route("/api/targets/:target_id/events", get(list_events))
        .route("/api/targets/:target_id/runs/:run_id/verify", post(verify_run))
        .route("/api/runs/:run_id", get(get_run))
        .route("/api/runs/:run_id/discard", post(discard_run))
        .route("/api/jobs/:job_id", get(get_job))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /api/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

pub(crate) async fn create_target(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateTargetRequest>,
) -> ApiResult<Json<TargetResponse>> {
    let root = normalize_domain(&req.root_domain);
    if root.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "invalid root_domain: {:?}",
            req.root_domain
        )));
    }

    let target =
        dsc_db::get_or_create_target(&st.pool, &root, req.name.as_deref(), req.scope).await?;
    Ok(Json(target_response(target)))
}

pub(crate) async fn list_targets(
    State(st): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<TargetResponse>>> {
    let targets = dsc_db::list_targets(&st.pool).await?;
    Ok(Json(targets.into_iter().map(target_response).collect()))
}

fn target_response(t: dsc_db::TargetRow) -> TargetResponse {
    TargetResponse {
        id: t.id,
        name: t.name,
        root_domain: t.root_domain,
        scope: t.scope,
        created_at: t.created_at,
    }
}

// ---------------------------------------------------------------------------
// POST /api/targets/:id/pipeline
// ---------------------------------------------------------------------------

pub(crate) async fn start_pipeline(
    State(st): State<Arc<AppState>>,
    Path(target_id): Path<Uuid>,
    Json(req): Json<StartPipelineRequest>,
) -> ApiResult<Json<StartPipelineResponse>> {
    let target = dsc_db::fetch_target(&st.pool, target_id)
        .await?
        .ok_or(ApiError::NotFound("target"))?;

    // Scope gate: an explicit probe domain outside the allow-list is refused
    // before any run or job exists.
    if let Some(domain) = req.domain.as_deref() {
        let scope = parse_scope(target.scope.as_ref(), &target.root_domain);
        let normalized = normalize_domain(domain);
        if !domain_in_scope(&scope, &normalized) {
            return Err(ApiError::BadRequest(format!(
                "domain {normalized:?} is out of scope for target {}",
                target.root_domain
            )));
        }
    }

    let mut conn = st.pool.acquire().await?;
    let run = dsc_db::create_run(&mut conn, target_id, RunTrigger::Manual).await?;

    let payload = json!({
        "max_hosts": req.max_hosts,
        "max_http_targets": req.max_http_targets,
        "scheduled": false,
    });
    let job = dsc_db::enqueue_job(
        &mut conn,
        &NewJob {
            job_type: JobType::RunPipeline,
            target_id,
            run_id: Some(run.id),
            payload: payload.clone(),
            available_at: None,
        },
    )
    .await?;

    dsc_audit::log_event(
        &mut conn,
        target_id,
        Some(run.id),
        event_type::PIPELINE_TRIGGERED,
        Some(payload),
        ACTOR_USER,
    )
    .await?;

    Ok(Json(StartPipelineResponse {
        status: "queued",
        run_id: run.id,
        job_id: job.id,
    }))
}

// ---------------------------------------------------------------------------
// Runs and jobs
// ---------------------------------------------------------------------------

pub(crate) async fn get_run(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<RunResponse>> {
    let run = dsc_db::fetch_run(&st.pool, run_id)
        .await?
        .ok_or(ApiError::NotFound("run"))?;
    Ok(Json(RunResponse {
        id: run.id,
        target_id: run.target_id,
        trigger: run.trigger.as_str().to_string(),
        status: run.status.as_str().to_string(),
        started_at: run.started_at,
        completed_at: run.completed_at,
        created_at: run.created_at,
    }))
}

pub(crate) async fn get_job(
    State(st): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobResponse>> {
    let job = dsc_db::fetch_job(&st.pool, job_id)
        .await?
        .ok_or(ApiError::NotFound("job"))?;
    Ok(Json(JobResponse {
        id: job.id,
        job_type: job.job_type.as_str().to_string(),
        status: job.status.as_str().to_string(),
        target_id: job.target_id,
        run_id: job.run_id,
        payload: job.payload,
        available_at: job.available_at,
        locked_at: job.locked_at,
        locked_by: job.locked_by,
        attempts: job.attempts,
        last_error: job.last_error,
        created_at: job.created_at,
    }))
}

pub(crate) async fn discard_run(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    body: Option<Json<DiscardRunRequest>>,
) -> ApiResult<Json<DiscardRunResponse>> {
    if dsc_db::fetch_run(&st.pool, run_id).await?.is_none() {
        return Err(ApiError::NotFound("run"));
    }

    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "discarded_by_user".to_string());
    dsc_db::discard_run(&st.pool, run_id, &reason).await?;

    Ok(Json(DiscardRunResponse {
        status: "discarded",
        run_id,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/targets/:tid/runs/:rid/verify
// ---------------------------------------------------------------------------

pub(crate) async fn verify_run(
    State(st): State<Arc<AppState>>,
    Path((target_id, run_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<VerifyRunResponse>> {
    let run = dsc_db::fetch_run(&st.pool, run_id)
        .await?
        .filter(|r| r.target_id == target_id)
        .ok_or(ApiError::NotFound("run"))?;

    let summary = dsc_pipeline::reenqueue_stale_verifications(
        &st.pool,
        target_id,
        run.id,
        &SweepPolicy::default(),
    )
    .await?;

    Ok(Json(VerifyRunResponse {
        status: "queued",
        run_id,
        verify_jobs_enqueued: summary.assets_marked + summary.services_marked,
    }))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

pub(crate) async fn create_schedule(
    State(st): State<Arc<AppState>>,
    Path(target_id): Path<Uuid>,
    Json(req): Json<CreateScheduleRequest>,
) -> ApiResult<Json<ScheduleResponse>> {
    if dsc_db::fetch_target(&st.pool, target_id).await?.is_none() {
        return Err(ApiError::NotFound("target"));
    }
    if req.interval_seconds < dsc_db::MIN_INTERVAL_SECONDS {
        return Err(ApiError::BadRequest(format!(
            "interval_seconds must be >= {}",
            dsc_db::MIN_INTERVAL_SECONDS
        )));
    }

    let schedule = dsc_db::create_schedule(
        &st.pool,
        &dsc_db::NewSchedule {
            target_id,
            enabled: req.enabled.unwrap_or(true),
            interval_seconds: req.interval_seconds,
            next_run_at: None,
            pipeline_config: req.pipeline_config,
        },
    )
    .await?;

    Ok(Json(schedule_response(schedule)))
}

pub(crate) async fn list_schedules(
    State(st): State<Arc<AppState>>,
    Path(target_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ScheduleResponse>>> {
    let schedules = dsc_db::list_schedules(&st.pool, target_id).await?;
    Ok(Json(schedules.into_iter().map(schedule_response).collect()))
}

fn schedule_response(s: dsc_db::ScheduleRow) -> ScheduleResponse {
    ScheduleResponse {
        id: s.id,
        target_id: s.target_id,
        enabled: s.enabled,
        interval_seconds: s.interval_seconds,
        next_run_at: s.next_run_at,
        pipeline_config: s.pipeline_config,
    }
}

// ---------------------------------------------------------------------------
// Inventory reads
// ---------------------------------------------------------------------------

fn parse_status_filter(filter: &StatusFilter) -> ApiResult<Option<LifecycleStatus>> {
    filter
        .status
        .as_deref()
        .map(|s| LifecycleStatus::parse(s).map_err(|e| ApiError::BadRequest(e.to_string())))
        .transpose()
}

pub(crate) async fn list_assets(
    State(st): State<Arc<AppState>>,
    Path(target_id): Path<Uuid>,
    Query(filter): Query<StatusFilter>,
) -> ApiResult<Json<Vec<AssetResponse>>> {
    let status = parse_status_filter(&filter)?;
    let mut conn = st.pool.acquire().await?;
    let assets = dsc_inventory::list_assets(&mut conn, target_id, status).await?;

    Ok(Json(
        assets
            .into_iter()
            .map(|a| AssetResponse {
                id: a.id,
                asset_type: a.asset_type.as_str().to_string(),
                value: a.value,
                normalized: a.normalized,
                status: a.status.as_str().to_string(),
                status_reason: a.status_reason,
                first_seen_run_id: a.first_seen_run_id,
                last_seen_run_id: a.last_seen_run_id,
                first_seen_at: a.first_seen_at,
                last_seen_at: a.last_seen_at,
                verified_at: a.verified_at,
                verified_run_id: a.verified_run_id,
            })
            .collect(),
    ))
}

pub(crate) async fn list_events(
    State(st): State<Arc<AppState>>,
    Path(target_id): Path<Uuid>,
    Query(page): Query<EventsQuery>,
) -> ApiResult<Json<Vec<RunEventResponse>>> {
    let limit = page.limit.unwrap_or(100).clamp(1, 1000);
    let mut conn = st.pool.acquire().await?;
    let events = dsc_audit::list_events(&mut conn, target_id, limit).await?;

    Ok(Json(
        events
            .into_iter()
            .map(|e| RunEventResponse {
                id: e.id,
                run_id: e.run_id,
                event_type: e.event_type,
                detail: e.detail,
                actor: e.actor,
                created_at: e.created_at,
            })
            .collect(),
    ))
}

pub(crate) async fn list_services(
    State(st): State<Arc<AppState>>,
    Path(target_id): Path<Uuid>,
    Query(filter): Query<StatusFilter>,
) -> ApiResult<Json<Vec<ServiceResponse>>> {
    let status = parse_status_filter(&filter)?;
    let mut conn = st.pool.acquire().await?;
    let services = dsc_inventory::list_services(&mut conn, target_id, status).await?;

    Ok(Json(
        services
            .into_iter()
            .map(|s| ServiceResponse {
                id: s.id,
                asset_id: s.asset_id,
                port: s.port,
                proto: s.proto.as_str().to_string(),
                name: s.name,
                product: s.product,
                version: s.version,
                status: s.status.as_str().to_string(),
                status_reason: s.status_reason,
                last_seen_run_id: s.last_seen_run_id,
                verified_run_id: s.verified_run_id,
            })
            .collect(),
    ))
}
