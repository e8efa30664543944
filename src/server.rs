//! HTTP surface: the CRM webhook, read-only dashboard endpoints and the
//! assignment event stream.

use crate::backends::WorkRecord;
use crate::engine::{AssignError, AssignmentResult, Engine};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Bitrix event fired when a deal is created.
pub const DEAL_ADD_EVENT: &str = "ONCRMDEALADD";

const DEFAULT_RECENT_LIMIT: usize = 10;
const MAX_RECENT_LIMIT: usize = 500;

type AppState = Arc<Engine>;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/webhook", post(webhook).get(manual_trigger))
        .route("/api/webhook", post(webhook).get(manual_trigger))
        .route("/api/agents", get(agents))
        .route("/api/assignments", get(assignments))
        .route("/api/stats", get(stats))
        .route("/api/events", get(events))
        .route("/health", get(health))
        .with_state(engine)
}

/// JSON error body with a status code.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }

    fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AssignError> for ApiError {
    fn from(err: AssignError) -> Self {
        match err {
            AssignError::NoAgentsAvailable => Self::bad_request("No agents available"),
            AssignError::NoSelection => Self::bad_request("Could not determine least loaded agent"),
            AssignError::AlreadyAssigned { record_id } => Self {
                status: StatusCode::CONFLICT,
                body: json!({ "error": "Deal already assigned", "dealId": record_id }),
            },
            AssignError::RemoteFailure { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to assign lead")
            }
            AssignError::Discovery(e) => {
                tracing::error!(err = %e, "webhook agent discovery failed");
                Self::internal()
            }
        }
    }
}

/// Pull `(id, title)` out of a webhook body; `None` if the shape is wrong.
fn deal_fields(body: &Value) -> Option<(String, String)> {
    let fields = body.get("data")?.get("FIELDS")?;
    let id = match fields.get("ID")? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let title = fields
        .get("TITLE")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some((id, title))
}

async fn webhook(State(engine): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(err = %e, "webhook body is not JSON");
        ApiError::bad_request("Invalid webhook payload")
    })?;

    let event = payload.get("event").and_then(Value::as_str).unwrap_or_default();
    if event != DEAL_ADD_EVENT {
        tracing::debug!(event, "ignoring webhook event");
        return Err(ApiError::bad_request("Unsupported webhook event"));
    }

    let (id, title) =
        deal_fields(&payload).ok_or_else(|| ApiError::bad_request("Invalid webhook payload"))?;
    tracing::info!(deal_id = %id, "deal created webhook");
    assign(&engine, id, title).await
}

/// Manual trigger: routes a synthetic test record through the webhook path.
async fn manual_trigger(State(engine): State<AppState>) -> Result<Json<Value>, ApiError> {
    let id = format!("TEST_{}", chrono::Utc::now().timestamp_millis());
    tracing::info!(deal_id = %id, "manual webhook trigger");
    assign(&engine, id, "Test Lead".to_string()).await
}

async fn assign(engine: &Engine, id: String, title: String) -> Result<Json<Value>, ApiError> {
    let record = WorkRecord {
        id,
        title,
        created_at: chrono::Utc::now().to_rfc3339(),
        owner: None,
        status: engine.config().open_status.clone(),
    };
    let result = engine.assign_single(&record).await?;
    Ok(Json(json!({
        "success": true,
        "dealId": result.record_id,
        "assignedTo": result.agent_id,
    })))
}

async fn agents(State(engine): State<AppState>) -> Json<Value> {
    let snapshot = engine.agents();
    let agents: Vec<Value> = snapshot
        .agents
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "name": a.display_name(),
                "online": a.online,
                "openWorkCount": a.open_work_count,
            })
        })
        .collect();
    Json(json!({ "refreshedAt": snapshot.refreshed_at, "agents": agents }))
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    limit: Option<usize>,
}

async fn assignments(
    State(engine): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);
    let entries = engine.ledger().recent(limit).await.map_err(|e| {
        tracing::error!(?e, "reading ledger failed");
        ApiError::internal()
    })?;
    Ok(Json(json!(entries)))
}

async fn stats(State(engine): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = engine.stats().await.map_err(|e| {
        tracing::error!(?e, "computing dashboard stats failed");
        ApiError::internal()
    })?;
    Ok(Json(json!({
        "activeAgents": stats.active_agents,
        "assignedToday": stats.assigned_today,
        "pendingDeals": stats.pending,
    })))
}

fn event_for(result: &AssignmentResult) -> Event {
    let kind = if result.is_success() { "assigned" } else { "failed" };
    Event::default()
        .event(kind)
        .json_data(result)
        .unwrap_or_else(|_| Event::default().event(kind).data(result.record_id.clone()))
}

/// Server-sent stream of assignment results, successes and failures.
async fn events(
    State(engine): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(engine.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(result) => return Some((Ok(event_for(&result)), rx)),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
