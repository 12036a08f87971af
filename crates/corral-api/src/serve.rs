//! The HTTP façade: translates requests into core operations.
//!
//! Long-poll endpoints (`/tasks/{id}/wait`, `/tickets/{uuid}/wait`) hold
//! the connection open on a waiter registration -- there is no polling
//! loop -- and respond within the requested timeout plus scheduling slack.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use corral_core::Error;
use corral_core::tasks::{Task, TaskRegistry, WaitOutcome};
use corral_core::waitlist::{ListTickets, Ticket, TicketRequest, TicketStatus, Waitlist};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_param(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::BadParam(_) | Error::AgentRejected(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotActive(_) | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Timeout => StatusCode::REQUEST_TIMEOUT,
            Error::StoreUnavailable(_) | Error::AgentUnreachable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State & response types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    pub waitlist: Arc<Waitlist>,
    /// Stable for the lifetime of one process; reported by `/diagnostics`.
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CreatedTicketResponse {
    #[serde(flatten)]
    ticket: Ticket,
    /// Snapshot of the queue as seen immediately after creation.
    queue: Vec<Ticket>,
}

#[derive(Debug, Deserialize)]
struct CreateTicketBody {
    scope: String,
    id: String,
    expires_at: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    extra: Option<Value>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/diagnostics", get(diagnostics))
        .route("/servers/{server}/tasks/{kind}", post(create_task))
        .route("/servers/{server}/tasks", get(list_task_history))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/wait", get(wait_task))
        .route(
            "/servers/{server}/tickets",
            post(create_ticket)
                .get(list_tickets)
                .delete(delete_tickets),
        )
        .route("/tickets/{uuid}", get(get_ticket))
        .route("/tickets/{uuid}/wait", get(wait_ticket))
        .route("/tickets/{uuid}/release", put(release_ticket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    state: AppState,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("corrald listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;
    tracing::info!("corrald shut down");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to install Ctrl+C handler");
            }
        }
        _ = cancel.cancelled() => {}
    }
    // Stop the background drivers along with the listener.
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Parameter parsing
// ---------------------------------------------------------------------------

fn parse_int(raw: &str, name: &str) -> Result<i64, AppError> {
    raw.parse::<i64>()
        .map_err(|_| AppError::bad_param(format!("{name} must be an integer, got {raw:?}")))
}

/// `limit` must be a positive integer; upper bound enforced by the core.
fn parse_limit(params: &HashMap<String, String>) -> Result<Option<usize>, AppError> {
    match params.get("limit") {
        None => Ok(None),
        Some(raw) => {
            let value = parse_int(raw, "limit")?;
            if value < 1 {
                return Err(AppError::bad_param(format!(
                    "limit must be >= 1, got {value}"
                )));
            }
            Ok(Some(value as usize))
        }
    }
}

fn parse_offset(params: &HashMap<String, String>) -> Result<usize, AppError> {
    match params.get("offset") {
        None => Ok(0),
        Some(raw) => {
            let value = parse_int(raw, "offset")?;
            if value < 0 {
                return Err(AppError::bad_param(format!(
                    "offset must be >= 0, got {value}"
                )));
            }
            Ok(value as usize)
        }
    }
}

fn parse_timeout(params: &HashMap<String, String>) -> Result<Option<Duration>, AppError> {
    match params.get("timeout") {
        None => Ok(None),
        Some(raw) => {
            let value = parse_int(raw, "timeout")?;
            if value < 0 {
                return Err(AppError::bad_param(format!(
                    "timeout must be >= 0, got {value}"
                )));
            }
            Ok(Some(Duration::from_secs(value as u64)))
        }
    }
}

fn parse_force(params: &HashMap<String, String>) -> Result<bool, AppError> {
    match params.get("force").map(String::as_str) {
        None => Ok(false),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(AppError::bad_param(format!(
            "force must be \"true\" or \"false\", got {other:?}"
        ))),
    }
}

fn parse_json_body(body: &Bytes) -> Result<Value, AppError> {
    if body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|err| AppError::bad_param(format!("invalid JSON body: {err}")))
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

async fn diagnostics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "start_timestamp": state.started_at.to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn create_task(
    State(state): State<AppState>,
    Path((server_id, kind)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let params = parse_json_body(&body)?;
    if !params.is_object() {
        return Err(AppError::bad_param("task parameters must be a JSON object"));
    }

    let task = state.registry.create_task(&server_id, &kind, params).await?;
    Ok(Json(json!({ "id": task.id, "status": task.status })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.registry.get_task(&id)?))
}

async fn wait_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let timeout = parse_timeout(&params)?;
    match state.registry.wait_task(&id, timeout).await? {
        WaitOutcome::Completed(task) => Ok(Json(task).into_response()),
        // The distinguished timeout signal: the current (still active)
        // task under a timeout status.
        WaitOutcome::TimedOut(task) => {
            Ok((StatusCode::REQUEST_TIMEOUT, Json(task)).into_response())
        }
    }
}

async fn list_task_history(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> Json<Vec<Task>> {
    Json(state.registry.list_task_history(&server_id))
}

// ---------------------------------------------------------------------------
// Ticket handlers
// ---------------------------------------------------------------------------

async fn create_ticket(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreatedTicketResponse>), AppError> {
    let body: CreateTicketBody = serde_json::from_slice(&body)
        .map_err(|err| AppError::bad_param(format!("invalid ticket payload: {err}")))?;
    let expires_at = DateTime::parse_from_rfc3339(&body.expires_at)
        .map_err(|err| AppError::bad_param(format!("invalid expires_at: {err}")))?
        .with_timezone(&Utc);

    let created = state
        .waitlist
        .create_ticket(TicketRequest {
            server_id,
            scope: body.scope,
            id: body.id,
            expires_at,
            action: body.action,
            extra: body.extra,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreatedTicketResponse {
            ticket: created.ticket,
            queue: created.queue,
        }),
    ))
}

async fn list_tickets(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Ticket>>, AppError> {
    let opts = ListTickets {
        limit: parse_limit(&params)?,
        offset: parse_offset(&params)?,
        scope: params.get("scope").cloned(),
        status: params
            .get("status")
            .map(|raw| raw.parse::<TicketStatus>())
            .transpose()
            .map_err(|err| AppError::bad_param(err.to_string()))?,
    };
    Ok(Json(state.waitlist.list_tickets(&server_id, &opts).await?))
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Ticket>, AppError> {
    Ok(Json(state.waitlist.get_ticket(uuid).await?))
}

async fn wait_ticket(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, AppError> {
    let timeout = parse_timeout(&params)?;
    state.waitlist.wait_ticket(uuid, timeout).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn release_ticket(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.waitlist.release_ticket(uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_tickets(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, AppError> {
    let force = parse_force(&params)?;
    state.waitlist.delete_tickets(&server_id, force).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
