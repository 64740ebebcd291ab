//! Request/response bodies for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub root_domain: String,
    pub name: Option<String>,
    pub scope: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct TargetResponse {
    pub id: Uuid,
    pub name: String,
    pub root_domain: String,
    pub scope: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StartPipelineRequest {
    pub max_hosts: Option<u64>,
    pub max_http_targets: Option<u64>,
    /// Optional explicit probe domain; rejected when outside the target's
    /// scope before any run or job is created.
    pub domain: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartPipelineResponse {
    pub status: &'static str,
    pub run_id: Uuid,
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: Uuid,
    pub target_id: Uuid,
    pub trigger: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub target_id: Uuid,
    pub run_id: Option<Uuid>,
    pub payload: Option<Value>,
    pub available_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DiscardRunRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DiscardRunResponse {
    pub status: &'static str,
    pub run_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct VerifyRunResponse {
    pub status: &'static str,
    pub run_id: Uuid,
    pub verify_jobs_enqueued: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub interval_seconds: i64,
    pub enabled: Option<bool>,
    pub pipeline_config: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub id: Uuid,
    pub target_id: Uuid,
    pub enabled: bool,
    pub interval_seconds: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub pipeline_config: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct AssetResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub value: String,
    pub normalized: String,
    pub status: String,
    pub status_reason: Option<String>,
    pub first_seen_run_id: Option<Uuid>,
    pub last_seen_run_id: Option<Uuid>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_run_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ServiceResponse {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub port: i32,
    pub proto: String,
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub status: String,
    pub status_reason: Option<String>,
    pub last_seen_run_id: Option<Uuid>,
    pub verified_run_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StatusFilter {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunEventResponse {
    pub id: Uuid,
    pub run_id: Option<Uuid>,
    pub event_type: String,
    pub detail: Option<Value>,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
