use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use server_api::{
    apply_command_with_retry, cast_vote, create_proposal, create_session, decide_proxy,
    list_sessions, load_snapshot, register_attendance, session_view, ApiContext, ChangeNotifier,
};
use shared::{
    clock::SystemClock,
    domain::{AttendanceId, ProposalId, ProposalRecord, SessionId, SessionSnapshot, SessionSummary},
    error::{ApiError, ErrorCode},
    protocol::{
        CastVoteRequest, CommandOutcome, CreateProposalRequest, ProxyDecisionRequest,
        RegisterAttendanceRequest, RegisterAttendanceResponse, SessionCommand,
    },
    view::SessionView,
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod app_state;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type HttpError = (StatusCode, Json<ApiError>);

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext::new(
        storage,
        Arc::new(SystemClock),
        ChangeNotifier::new(settings.broadcast_capacity),
    );

    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, broadcast_capacity = settings.broadcast_capacity, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", get(http_list_sessions).post(http_create_session))
        .route("/sessions/:session_id", get(http_get_session))
        .route("/sessions/:session_id/view", get(http_session_view))
        .route("/sessions/:session_id/commands", post(http_apply_command))
        .route("/sessions/:session_id/proposals", post(http_create_proposal))
        .route("/sessions/:session_id/attendance", post(http_register_attendance))
        .route("/sessions/:session_id/ws", get(ws::session_feed))
        .route("/attendance/:attendance_id/proxy", post(http_decide_proxy))
        .route("/proposals/:proposal_id/votes", post(http_cast_vote))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidTransition | ErrorCode::ConcurrentModification => StatusCode::CONFLICT,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        error!(error = %e, "health check failed");
        http_error(ApiError::unavailable(e.to_string()))
    })?;
    Ok("ok")
}

async fn http_list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionSummary>>, HttpError> {
    let sessions = list_sessions(&state.api).await.map_err(http_error)?;
    Ok(Json(sessions))
}

async fn http_create_session(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<SessionSnapshot>), HttpError> {
    let snapshot = create_session(&state.api).await.map_err(http_error)?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn http_get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> Result<Json<SessionSnapshot>, HttpError> {
    let snapshot = load_snapshot(&state.api, SessionId(session_id))
        .await
        .map_err(http_error)?;
    Ok(Json(snapshot))
}

async fn http_session_view(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> Result<Json<SessionView>, HttpError> {
    let view = session_view(&state.api, SessionId(session_id))
        .await
        .map_err(http_error)?;
    Ok(Json(view))
}

async fn http_apply_command(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Json(command): Json<SessionCommand>,
) -> Result<Json<CommandOutcome>, HttpError> {
    let outcome = apply_command_with_retry(&state.api, SessionId(session_id), command)
        .await
        .map_err(http_error)?;
    Ok(Json(outcome))
}

async fn http_create_proposal(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Json(req): Json<CreateProposalRequest>,
) -> Result<(StatusCode, Json<ProposalRecord>), HttpError> {
    let (proposal, _) = create_proposal(
        &state.api,
        SessionId(session_id),
        &req.title,
        req.description.as_deref(),
    )
    .await
    .map_err(http_error)?;
    Ok((StatusCode::CREATED, Json(proposal)))
}

async fn http_register_attendance(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Json(req): Json<RegisterAttendanceRequest>,
) -> Result<(StatusCode, Json<RegisterAttendanceResponse>), HttpError> {
    let (attendance, snapshot) =
        register_attendance(&state.api, SessionId(session_id), req.is_proxy)
            .await
            .map_err(http_error)?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterAttendanceResponse {
            attendance,
            snapshot,
        }),
    ))
}

async fn http_decide_proxy(
    State(state): State<Arc<AppState>>,
    Path(attendance_id): Path<i64>,
    Json(req): Json<ProxyDecisionRequest>,
) -> Result<Json<SessionSnapshot>, HttpError> {
    let snapshot = decide_proxy(&state.api, AttendanceId(attendance_id), req.decision)
        .await
        .map_err(http_error)?;
    Ok(Json(snapshot))
}

async fn http_cast_vote(
    State(state): State<Arc<AppState>>,
    Path(proposal_id): Path<i64>,
    Json(req): Json<CastVoteRequest>,
) -> Result<Json<SessionSnapshot>, HttpError> {
    let snapshot = cast_vote(
        &state.api,
        ProposalId(proposal_id),
        req.attendance_id,
        req.choice,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(snapshot))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
