use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobq_core::{DispatchError, JobError, JobId, JobResult, JobSpec, JobState, JobStatus, Tier};
use jobq_engine::{Dispatcher, QueueStats, SlotInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub max_wait: Duration,
}

/// REST API routes
pub fn create_rest_api(dispatcher: Arc<Dispatcher>, max_wait: Duration) -> Router {
    Router::new()
        .route("/api/v1/jobs", post(submit_job))
        .route("/api/v1/jobs/:job_id", get(get_job).delete(cancel_job))
        .route("/api/v1/jobs/:job_id/result", get(get_result))
        .route("/api/v1/queue/stats", get(get_stats))
        .route("/api/v1/workers", get(list_workers))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState {
            dispatcher,
            max_wait,
        })
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    id: Option<String>,
    role: String,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
    /// 0 (enterprise) to 3 (free). Wider than `u8` so out-of-range values
    /// reach validation instead of failing to parse.
    tier: Option<u64>,
    max_retries: Option<u32>,
    timeout_secs: Option<u64>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&base64::engine::general_purpose::STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: JobId,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_wait_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job_id: JobId,
    role: String,
    tier: Tier,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    slot: Option<String>,
    attempts_used: u32,
    max_retries: u32,
    submitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated_wait_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ResultResponse {
    job_id: JobId,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "base64_bytes")]
    output: Option<Vec<u8>>,
    /// Output as text when it is valid UTF-8
    #[serde(skip_serializing_if = "Option::is_none")]
    output_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JobError>,
    attempts_used: u32,
    total_wall_time_ms: u128,
}

impl From<JobResult> for ResultResponse {
    fn from(result: JobResult) -> Self {
        let output_text = result
            .output
            .as_ref()
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok());

        ResultResponse {
            job_id: result.job_id,
            state: result.state.name(),
            output: result.output,
            output_text,
            error: result.error,
            attempts_used: result.attempts_used,
            total_wall_time_ms: result.total_wall_time.as_millis(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResultQuery {
    /// Seconds to block waiting for a terminal state (default: don't wait)
    wait_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pending_jobs: usize,
    busy_slots: usize,
    total_slots: usize,
}

fn job_response(state: &ApiState, spec: JobSpec, status: JobStatus) -> JobResponse {
    let position = state.dispatcher.position(&spec.id).ok().flatten();

    let (retry_at, last_error) = match &status.state {
        JobState::Retrying {
            retry_at,
            last_error,
            ..
        } => (Some(*retry_at), Some(last_error.clone())),
        _ => (None, None),
    };

    JobResponse {
        job_id: spec.id,
        role: spec.role,
        tier: spec.tier,
        state: status.state.name(),
        slot: status.state.slot().map(str::to_string),
        attempts_used: status.attempts_used,
        max_retries: spec.max_retries,
        submitted_at: spec.submitted_at,
        updated_at: status.updated_at,
        started_at: status.started_at,
        finished_at: status.finished_at,
        retry_at,
        last_error,
        position: position.as_ref().map(|p| p.position),
        estimated_wait_secs: position.map(|p| p.estimated_wait.as_secs()),
    }
}

/// Submit a new job
async fn submit_job(
    State(state): State<ApiState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let config = state.dispatcher.config();

    let tier = match req.tier {
        Some(value) => {
            let value = u8::try_from(value).map_err(|_| {
                DispatchError::InvalidJobSpec(format!("tier {} out of range 0..=3", value))
            })?;
            Tier::try_from(value)?
        }
        None => Tier::default(),
    };

    let mut builder = JobSpec::builder(req.role, req.payload)
        .tier(tier)
        .max_retries(req.max_retries.unwrap_or(config.jobs.max_retries))
        .timeout(
            req.timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.default_timeout()),
        );

    if let Some(id) = req.id {
        builder = builder.id(id);
    }

    let job_id = state.dispatcher.submit(builder.build()?)?;
    let position = state.dispatcher.position(&job_id).ok().flatten();

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id,
            state: "pending",
            position: position.as_ref().map(|p| p.position),
            estimated_wait_secs: position.map(|p| p.estimated_wait.as_secs()),
        }),
    ))
}

/// Get job status by ID
async fn get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = JobId::new(job_id);
    let record = state
        .dispatcher
        .store()
        .get(&job_id)
        .ok_or(ApiError::Dispatch(DispatchError::NotFound(job_id)))?;

    Ok(Json(job_response(&state, record.spec, record.status)))
}

/// Get the terminal result, optionally waiting for it
async fn get_result(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Response, ApiError> {
    let job_id = JobId::new(job_id);
    let wait = Duration::from_secs(query.wait_secs.unwrap_or(0)).min(state.max_wait);

    match state.dispatcher.await_result(&job_id, Some(wait)).await {
        Ok(result) => Ok(Json(ResultResponse::from(result)).into_response()),
        Err(DispatchError::Timeout(_)) => {
            // Not finished yet: report where it stands instead
            let record = state
                .dispatcher
                .store()
                .get(&job_id)
                .ok_or(ApiError::Dispatch(DispatchError::NotFound(job_id)))?;
            Ok((
                StatusCode::ACCEPTED,
                Json(job_response(&state, record.spec, record.status)),
            )
                .into_response())
        }
        Err(e) => Err(e.into()),
    }
}

/// Cancel a job
async fn cancel_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job_id = JobId::new(job_id);

    if !state.dispatcher.cancel(&job_id)? {
        return Err(ApiError::Conflict(format!("Job {} already finished", job_id)));
    }

    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "cancelled": true,
    })))
}

/// Queue statistics
async fn get_stats(State(state): State<ApiState>) -> Json<QueueStats> {
    Json(state.dispatcher.stats())
}

/// List worker slots
async fn list_workers(State(state): State<ApiState>) -> Json<Vec<SlotInfo>> {
    Json(state.dispatcher.slots())
}

/// Health check endpoint
async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let dispatcher = &state.dispatcher;
    Json(HealthResponse {
        status: if dispatcher.is_shutting_down() {
            "shutting_down"
        } else {
            "healthy"
        },
        pending_jobs: dispatcher.queue().len(),
        busy_slots: dispatcher.pool().busy_count(),
        total_slots: dispatcher.pool().total_slots(),
    })
}

/// Prometheus text exposition
async fn metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let body = state
        .dispatcher
        .metrics()
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

/// API error types
#[derive(Debug)]
enum ApiError {
    Dispatch(DispatchError),
    Conflict(String),
    Internal(String),
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::Dispatch(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Dispatch(err) => {
                let status = match &err {
                    DispatchError::InvalidJobSpec(_) => StatusCode::BAD_REQUEST,
                    DispatchError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    DispatchError::NoWorkerForRole { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
                    DispatchError::DuplicateJob(_) | DispatchError::NotTerminal(_) => {
                        StatusCode::CONFLICT
                    }
                    DispatchError::QueueFull { .. } | DispatchError::ShuttingDown => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    DispatchError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };

                let mut body = serde_json::json!({ "error": err.to_string() });
                if let Some(kind) = err.kind() {
                    body["kind"] = serde_json::json!(kind.as_str());
                }
                if let DispatchError::NoWorkerForRole { job_id, .. } = &err {
                    body["job_id"] = serde_json::json!(job_id);
                }
                (status, body)
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({ "error": msg })),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": msg }),
            ),
        };

        (status, Json(body)).into_response()
    }
}
