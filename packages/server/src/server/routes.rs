//! Request/response types and handlers for the REST surface (spec §6).

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::CoreError;
use crate::jobs::model::{
    CompressionChoice, ExportFormat, JobDefinition, JobFilter, JobStatus, Provider,
};
use crate::planner::{PlanOptions, Verdict};
use crate::store::models::{AdvancedConfig, ScheduledEntry};

use super::app::AppState;

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0.category() {
            crate::error::ErrorCategory::Input => StatusCode::BAD_REQUEST,
            crate::error::ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            crate::error::ErrorCategory::Auth => StatusCode::UNAUTHORIZED,
            crate::error::ErrorCategory::Conflict => StatusCode::CONFLICT,
            crate::error::ErrorCategory::Transient | crate::error::ErrorCategory::NetworkDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            crate::error::ErrorCategory::Storage | crate::error::ErrorCategory::Fatal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ErrorBody {
            code: format!("{:?}", self.0.category()),
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

fn default_parallel_streams() -> u8 {
    1
}

#[derive(Debug, Deserialize)]
pub struct JobSubmitRequest {
    pub display_name: String,
    pub provider: Provider,
    pub source_id: String,
    pub destination: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub compression: CompressionChoice,
    #[serde(default = "default_parallel_streams")]
    pub parallel_streams: u8,
    #[serde(default)]
    pub remove_removable_media: bool,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub force_full: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl From<JobSubmitRequest> for JobDefinition {
    fn from(req: JobSubmitRequest) -> Self {
        JobDefinition::builder()
            .display_name(req.display_name)
            .provider(req.provider)
            .source_id(req.source_id)
            .destination(req.destination)
            .format(req.format)
            .compression(req.compression)
            .parallel_streams(req.parallel_streams)
            .remove_removable_media(req.remove_removable_media)
            .incremental(req.incremental)
            .force_full(req.force_full)
            .metadata(req.metadata)
            .build()
    }
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<JobSubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job_id = state.job_manager.submit(req.into()).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct JobQueryRequest {
    pub ids: Option<Vec<Uuid>>,
    pub status: Option<JobStatus>,
}

pub async fn query_jobs(
    State(state): State<AppState>,
    Json(req): Json<JobQueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = JobFilter {
        ids: req.ids,
        status: req.status,
    };
    let jobs = state.job_manager.query(&filter).await?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
pub struct JobCancelRequest {
    pub job_id: Uuid,
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Json(req): Json<JobCancelRequest>,
) -> Result<StatusCode, ApiError> {
    state.job_manager.cancel(req.job_id).await?;
    Ok(StatusCode::OK)
}

pub async fn job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .job_manager
        .get_job(job_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
    Ok(Json(job))
}

pub async fn job_stream(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.job_manager.progress_subscribe(job_id).await;
    let stream = BroadcastStream::new(rx).filter_map(|item| {
        item.ok()
            .and_then(|snapshot| serde_json::to_string(&snapshot).ok())
            .map(|json| Ok(Event::default().data(json)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub template: JobSubmitRequest,
    pub cron_expression: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

fn default_true() -> bool {
    true
}

pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduledEntry>), ApiError> {
    let entry = ScheduledEntry {
        id: Uuid::new_v4(),
        template: req.template.into(),
        cron_expression: req.cron_expression,
        timezone: req.timezone,
        enabled: req.enabled,
        advanced: req.advanced,
        last_run: None,
        next_run: None,
        total_runs: 0,
    };
    let created = state.scheduler.create_schedule(entry).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_schedules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.list_schedules().await)
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .scheduler
        .get_schedule(id)
        .await
        .map(Json)
        .ok_or_else(|| CoreError::NotFound(format!("schedule {id}")).into())
}

pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(mut entry): Json<ScheduledEntry>,
) -> Result<StatusCode, ApiError> {
    entry.id = id;
    state.scheduler.update_schedule(entry).await?;
    Ok(StatusCode::OK)
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.scheduler.delete_schedule(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::NotFound(format!("schedule {id}")).into())
    }
}

pub async fn schedule_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.scheduler.history(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CbtRequest {
    pub vm_id: String,
}

#[derive(Debug, Serialize)]
pub struct CbtStatusResponse {
    pub vm_id: String,
    pub tracking_active: bool,
}

/// CBT here means "is there a usable prior change-id set for this VM" —
/// the provider itself decides whether change tracking is actually
/// enabled on the hypervisor side (capabilities().supports_incremental).
pub async fn cbt_status(
    State(state): State<AppState>,
    Json(req): Json<CbtRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tracking_active = state.store.latest_change_id_set(&req.vm_id).await?.is_some();
    Ok(Json(CbtStatusResponse {
        vm_id: req.vm_id,
        tracking_active,
    }))
}

/// Disabling CBT discards the persisted change-id history, forcing the
/// next export for this VM to be a full export (the planner's
/// NoPriorExport path).
pub async fn cbt_disable(
    State(state): State<AppState>,
    Json(req): Json<CbtRequest>,
) -> Result<StatusCode, ApiError> {
    state.store.clear_change_id_sets(&req.vm_id).await?;
    Ok(StatusCode::OK)
}

/// Enabling CBT is a no-op acknowledgement: tracking resumes automatically
/// on the next incremental-eligible export once the provider reports
/// `supports_incremental`.
pub async fn cbt_enable(Json(_req): Json<CbtRequest>) -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct IncrementalAnalyzeRequest {
    pub provider: Provider,
    pub vm_id: String,
    #[serde(default)]
    pub force_full: bool,
}

pub async fn incremental_analyze(
    State(state): State<AppState>,
    Json(req): Json<IncrementalAnalyzeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let provider = state
        .providers
        .get(req.provider)
        .ok_or_else(|| CoreError::Fatal(format!("provider {:?} not configured", req.provider)))?;
    let verdict: Verdict = state
        .planner
        .plan(
            provider.as_ref(),
            &req.vm_id,
            &PlanOptions {
                force_full: req.force_full,
            },
        )
        .await?;
    Ok(Json(verdict))
}

#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    pub providers: HashMap<String, crate::provider::Capabilities>,
}

pub async fn capabilities(State(state): State<AppState>) -> impl IntoResponse {
    let mut providers = HashMap::new();
    for variant in state.providers.variants() {
        if let Some(p) = state.providers.get(variant) {
            providers.insert(variant.as_str().to_string(), p.capabilities());
        }
    }
    Json(CapabilitiesResponse { providers })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: chrono::DateTime<Utc>,
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub network: crate::network::NetworkState,
    pub pool: Option<crate::pool::PoolStats>,
    pub timestamp: chrono::DateTime<Utc>,
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let pool = match &state.pool {
        Some(p) => Some(p.stats().await),
        None => None,
    };
    Json(StatusResponse {
        network: state.network_monitor.state(),
        pool,
        timestamp: Utc::now(),
    })
}
