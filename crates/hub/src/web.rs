use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::controller::Sprinkler;
use crate::db::Db;
use crate::error::{ControlError, LinkError};
use crate::protocol::{parse_zone_state, StateReport, StatusReport, Zone};
use crate::state::SharedState;

const DEFAULT_CYCLE_LIMIT: i64 = 20;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub sprinkler: Sprinkler,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    Control(ControlError),
    Internal(anyhow::Error),
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        Self::Control(e)
    }
}

impl From<LinkError> for ApiError {
    fn from(e: LinkError) -> Self {
        Self::Control(ControlError::Link(e))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Control(e @ ControlError::Busy) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Control(e @ ControlError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            ApiError::Control(ControlError::Link(e)) => {
                error!("controller error: {e}");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            ApiError::Internal(e) => {
                error!("internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorResponse { detail })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/irrigation/state", get(sprinkler_state))
        .route("/api/irrigation/status", get(sprinkler_status))
        .route("/api/irrigation/zone/{zone}/{state}", put(sprinkler_control))
        .route("/api/irrigation/cycle", delete(sprinkler_end_cycle))
        .route("/api/irrigation/cycle/{ms}", put(sprinkler_start_cycle))
        .route("/api/irrigation/cycle/status", get(cycle_status))
        .route("/api/irrigation/schedule", get(schedule))
        .route("/api/irrigation/cycles", get(cycles))
        .with_state(state)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

async fn sprinkler_state(State(app): State<AppState>) -> ApiResult<StateReport> {
    Ok(Json(app.sprinkler.state().await?.to_report()))
}

async fn sprinkler_status(State(app): State<AppState>) -> ApiResult<StatusReport> {
    Ok(Json(app.sprinkler.status().await?))
}

async fn sprinkler_control(
    State(app): State<AppState>,
    Path((zone, state)): Path<(u8, String)>,
) -> ApiResult<StatusReport> {
    let zone = Zone::new(zone)
        .ok_or_else(|| ControlError::InvalidRequest(format!("no such zone {zone} (use 1-4)")))?;
    let on = parse_zone_state(&state).map_err(ControlError::InvalidRequest)?;

    app.sprinkler.control(zone, on).await?;
    app.shared.write().await.record_zone(zone, on);
    Ok(Json(app.sprinkler.status().await?))
}

async fn sprinkler_start_cycle(
    State(app): State<AppState>,
    Path(ms): Path<u64>,
) -> ApiResult<StatusReport> {
    let report = app.sprinkler.start_cycle(ms).await?;
    app.shared
        .write()
        .await
        .record_system(format!("manual watchdog armed for {ms} ms"));
    Ok(Json(report))
}

async fn sprinkler_end_cycle(State(app): State<AppState>) -> ApiResult<StatusReport> {
    let report = app.sprinkler.end_cycle().await?;
    app.shared
        .write()
        .await
        .record_system("manual endcycle".to_string());
    Ok(Json(report))
}

#[derive(Serialize)]
struct CycleStatusResponse {
    status: String,
    updated_at: Option<i64>,
    /// A cycle currently holds the controller.
    running: bool,
}

async fn cycle_status(State(app): State<AppState>) -> ApiResult<CycleStatusResponse> {
    let running = app.sprinkler.cycle_running();
    let resp = match app.db.get_status().await? {
        Some(s) => CycleStatusResponse {
            status: s.text,
            updated_at: Some(s.updated_at),
            running,
        },
        None => CycleStatusResponse {
            status: "No Status".to_string(),
            updated_at: None,
            running,
        },
    };
    Ok(Json(resp))
}

async fn schedule(State(app): State<AppState>) -> impl IntoResponse {
    app.db.load_schedule().await.map(Json).map_err(ApiError::from)
}

#[derive(Deserialize)]
struct CyclesQuery {
    limit: Option<i64>,
}

async fn cycles(State(app): State<AppState>, Query(q): Query<CyclesQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_CYCLE_LIMIT).clamp(1, 500);
    app.db.load_cycles(limit).await.map(Json).map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Used when `WEB_PORT` is unset.
pub const DEFAULT_WEB_PORT: u16 = 8080;

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
