use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::collect::{JobManager, JobParams};
use crate::error::CollectError;

pub fn routes() -> Router<JobManager> {
    Router::new()
        .route("/status", get(get_status))
        .route("/events", get(get_events))
        .route("/events/selected", get(get_selected_event))
        .route("/events/select", post(select_event))
        .route("/patterns", get(get_patterns))
        .route("/jobs", post(start_job))
        .route("/jobs/stop", post(stop_job))
}

type ApiResult = (StatusCode, Json<Value>);

fn ok(body: Value) -> ApiResult {
    (StatusCode::OK, Json(body))
}

fn fail(status: StatusCode, message: impl ToString) -> ApiResult {
    (status, Json(json!({ "error": message.to_string() })))
}

pub async fn get_status(State(manager): State<JobManager>) -> Json<Value> {
    Json(json!(manager.results().snapshot()))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    limit: Option<usize>,
}

pub async fn get_events(
    State(manager): State<JobManager>,
    Query(query): Query<EventsQuery>,
) -> Json<Value> {
    let results = manager.results();
    let events = match query.limit {
        Some(limit) => results.recent(limit),
        None => results.events(),
    };
    Json(json!({ "total": results.len(), "events": events }))
}

pub async fn get_selected_event(State(manager): State<JobManager>) -> Json<Value> {
    Json(json!({ "event": manager.results().selected_event() }))
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    index: Option<usize>,
}

pub async fn select_event(
    State(manager): State<JobManager>,
    Json(req): Json<SelectRequest>,
) -> ApiResult {
    if manager.results().select(req.index) {
        ok(json!({ "status": "ok", "event": manager.results().selected_event() }))
    } else {
        fail(StatusCode::NOT_FOUND, "No event at that index")
    }
}

pub async fn get_patterns(State(manager): State<JobManager>) -> Json<Value> {
    Json(json!({ "patterns": manager.patterns() }))
}

pub async fn start_job(
    State(manager): State<JobManager>,
    Json(params): Json<JobParams>,
) -> ApiResult {
    match manager.start(params).await {
        Ok(()) => ok(json!({ "status": "ok" })),
        Err(e) if matches!(e.downcast_ref::<CollectError>(), Some(CollectError::AlreadyRunning)) => {
            fail(StatusCode::CONFLICT, e)
        }
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn stop_job(State(manager): State<JobManager>) -> ApiResult {
    match manager.stop().await {
        Ok(()) => ok(json!({ "status": "ok", "state": manager.results().state() })),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
