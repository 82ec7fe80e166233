use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::aggregator::{DailyAggregator, DailySummary};
use crate::config::RUN_LIST_DEFAULT_LIMIT;
use crate::db::models::PricingRunRow;
use crate::db::RunStore;
use crate::dispatcher::Dispatcher;
use crate::error::AppError;
use crate::types::{parse_decimal, DispatchReport, RunResults, RunStatus};

#[derive(Clone)]
pub struct ApiState {
    pub store: RunStore,
    pub dispatcher: Dispatcher,
    pub aggregator: DailyAggregator,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(enqueue_run).get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/dispatch", post(trigger_dispatch))
        .route("/callbacks/pricing", post(ingest_callback))
        .route("/market-updates/today", get(today_summary))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct EnqueueRequest {
    pub scenario_type: Option<String>,
}

/// Completion payload from the external executor. `rate` and
/// `discount_points` arrive as string or number depending on the executor's
/// mood; `run_id` is validated in the handler so its absence maps to 400.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackPayload {
    pub run_id: Option<String>,
    pub rate: Option<Value>,
    pub discount_points: Option<Value>,
    pub status: Option<String>,
    pub screenshot_1: Option<String>,
    pub screenshot_2: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub run_id: String,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub run_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub status: String,
    pub scenario_type: Option<String>,
    pub retry_count: i64,
    pub queued_at: Option<i64>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub results: Option<Value>,
    pub error_message: Option<String>,
}

impl From<PricingRunRow> for RunResponse {
    fn from(row: PricingRunRow) -> Self {
        let results = row
            .results_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());
        Self {
            id: row.id,
            status: row.status,
            scenario_type: row.scenario_type,
            retry_count: row.retry_count,
            queued_at: row.queued_at,
            created_at: row.created_at,
            completed_at: row.completed_at,
            results,
            error_message: row.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queued: i64,
    pub running: i64,
    pub failed_exhausted: i64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn enqueue_run(
    State(state): State<ApiState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    let run = state.store.enqueue(req.scenario_type.as_deref()).await?;
    info!(
        run_id = %run.id,
        scenario_type = run.scenario_type.as_deref().unwrap_or("ad-hoc"),
        "Pricing run enqueued"
    );
    Ok(Json(EnqueueResponse { success: true, run_id: run.id }))
}

async fn trigger_dispatch(
    State(state): State<ApiState>,
) -> Result<Json<DispatchReport>, AppError> {
    let report = state.dispatcher.dispatch_once().await?;
    Ok(Json(report))
}

async fn ingest_callback(
    State(state): State<ApiState>,
    Json(payload): Json<CallbackPayload>,
) -> Result<Json<CallbackResponse>, AppError> {
    let run_id = payload
        .run_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::InvalidPayload("run_id is required".to_string()))?;

    let run = state
        .store
        .get(run_id)
        .await?
        .ok_or_else(|| AppError::RunNotFound(run_id.to_string()))?;

    let final_status = if payload.status.as_deref() == Some("failed") {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };

    let results = RunResults {
        rate: non_empty_value(payload.rate),
        discount_points: non_empty_value(payload.discount_points),
        screenshot_1: non_empty_string(payload.screenshot_1),
        screenshot_2: non_empty_string(payload.screenshot_2),
    };
    let error_message = if final_status == RunStatus::Failed {
        payload.error_message.as_deref().filter(|s| !s.trim().is_empty())
    } else {
        None
    };

    let results_ref = if results.is_empty() { None } else { Some(&results) };
    let applied = state
        .store
        .finalize(run_id, final_status, results_ref, error_message)
        .await?;
    if !applied {
        // Terminal runs ignore replays: acknowledged, nothing re-applied,
        // no aggregation.
        return Ok(Json(CallbackResponse {
            success: false,
            run_id: run_id.to_string(),
            status: run.status,
            message: Some("run already finalized; callback ignored".to_string()),
        }));
    }

    info!(
        run_id = %run_id,
        status = %final_status,
        "Pricing run finalized via callback"
    );

    if final_status == RunStatus::Completed {
        if let (Some(scenario), Some(rate_value)) =
            (run.scenario_type.as_deref(), results.rate.as_ref())
        {
            if let Some(rate) = parse_decimal(rate_value) {
                let points = results.discount_points.as_ref().and_then(parse_decimal);
                // The run is already finalized — an aggregation failure is
                // logged, not surfaced to the executor.
                if let Err(e) = state.aggregator.record(scenario, rate, points).await {
                    error!(run_id = %run_id, scenario, "Daily aggregation failed: {e}");
                }
            }
        }
    }

    Ok(Json(CallbackResponse {
        success: true,
        run_id: run_id.to_string(),
        status: final_status.as_str().to_string(),
        message: None,
    }))
}

async fn get_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, AppError> {
    let run = state
        .store
        .get(&id)
        .await?
        .ok_or_else(|| AppError::RunNotFound(id))?;
    Ok(Json(run.into()))
}

async fn list_runs(
    State(state): State<ApiState>,
    Query(params): Query<RunsQuery>,
) -> Result<Json<Vec<RunResponse>>, AppError> {
    let limit = params.limit.unwrap_or(RUN_LIST_DEFAULT_LIMIT);
    let rows = state.store.recent(params.status.as_deref(), limit).await?;
    Ok(Json(rows.into_iter().map(RunResponse::from).collect()))
}

async fn today_summary(
    State(state): State<ApiState>,
) -> Result<Json<DailySummary>, AppError> {
    Ok(Json(state.aggregator.today().await?))
}

async fn health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let counts = state.store.status_counts().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        queued: counts.queued,
        running: counts.running,
        failed_exhausted: counts.failed_exhausted,
    }))
}

fn non_empty_value(v: Option<Value>) -> Option<Value> {
    v.filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

fn non_empty_string(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
