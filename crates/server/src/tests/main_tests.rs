use super::*;
use std::time::Duration;

use axum::{body, body::Body, http::Request, response::Response};
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use shared::{clock::ManualClock, domain::Phase, domain::TimerState, protocol::ServerEvent};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

async fn test_app() -> (Router, Arc<ManualClock>, ApiContext) {
    test_app_with(ChangeNotifier::new(32)).await
}

async fn test_app_with(notifier: ChangeNotifier) -> (Router, Arc<ManualClock>, ApiContext) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 14, 18, 0, 0)
            .single()
            .expect("valid instant"),
    ));
    let api = ApiContext::new(storage, clock.clone(), notifier);
    let app = build_router(Arc::new(AppState { api: api.clone() }));
    (app, clock, api)
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

type Feed = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_snapshot(feed: &mut Feed) -> SessionSnapshot {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), feed.next())
            .await
            .expect("frame in time")
            .expect("feed open")
            .expect("frame");
        if let Message::Text(text) = msg {
            match serde_json::from_str::<ServerEvent>(&text).expect("event") {
                ServerEvent::SessionChanged { snapshot } => return snapshot,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}

fn post_json(uri: impl AsRef<str>, json: serde_json::Value) -> Request<Body> {
    Request::post(uri.as_ref())
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .expect("request")
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn new_session(app: &Router) -> i64 {
    let response = app
        .clone()
        .oneshot(Request::post("/sessions").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let snapshot: SessionSnapshot = read_json(response).await;
    assert_eq!(snapshot.version(), 1);
    snapshot.session_id().0
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _, _) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn commands_drive_the_session_and_map_errors_to_statuses() {
    let (app, clock, _) = test_app().await;
    let session_id = new_session(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            format!("/sessions/{session_id}/commands"),
            serde_json::json!({ "type": "start_debate" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let outcome: CommandOutcome = read_json(response).await;
    assert!(outcome.changed);
    assert_eq!(outcome.snapshot.session.phase, Phase::Debate);

    let response = app
        .clone()
        .oneshot(post_json(
            format!("/sessions/{session_id}/commands"),
            serde_json::json!({ "type": "start_debate" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::InvalidTransition);

    let response = app
        .clone()
        .oneshot(post_json(
            format!("/sessions/{session_id}/commands"),
            serde_json::json!({ "type": "start_timer", "payload": { "duration_seconds": 0 } }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(
            format!("/sessions/{session_id}/commands"),
            serde_json::json!({ "type": "start_timer", "payload": { "duration_seconds": 300 } }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    clock.advance_seconds(40);
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/sessions/{session_id}/view"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let view: SessionView = read_json(response).await;
    assert_eq!(view.timer_state, TimerState::Running);
    assert_eq!(view.remaining_seconds, 260);

    let response = app
        .oneshot(post_json(
            "/sessions/9999/commands",
            serde_json::json!({ "type": "close_voting" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn external_flows_round_trip_over_http() {
    let (app, _, api) = test_app().await;
    let session_id = new_session(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            format!("/sessions/{session_id}/proposals"),
            serde_json::json!({ "title": "Budget" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let proposal: ProposalRecord = read_json(response).await;
    assert_eq!(proposal.order, 1);

    let response = app
        .clone()
        .oneshot(post_json(
            format!("/sessions/{session_id}/attendance"),
            serde_json::json!({ "is_proxy": true }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let registered: RegisterAttendanceResponse = read_json(response).await;
    let attendance_id = registered.attendance.attendance_id.0;

    let response = app
        .clone()
        .oneshot(post_json(
            format!("/attendance/{attendance_id}/proxy"),
            serde_json::json!({ "decision": "approve" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json(
            format!("/proposals/{}/votes", proposal.proposal_id.0),
            serde_json::json!({ "attendance_id": attendance_id, "choice": "yes" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let mut rx = api.notifier.subscribe();
    for command in [
        serde_json::json!({ "type": "start_debate" }),
        serde_json::json!({
            "type": "open_proposal",
            "payload": { "proposal_id": proposal.proposal_id.0 },
        }),
    ] {
        let response = app
            .clone()
            .oneshot(post_json(format!("/sessions/{session_id}/commands"), command))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app
        .clone()
        .oneshot(post_json(
            format!("/proposals/{}/votes", proposal.proposal_id.0),
            serde_json::json!({ "attendance_id": attendance_id, "choice": "yes" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(api.notifier.subscriber_count(), 1);
    assert!(rx.try_recv().is_ok());

    let response = app
        .oneshot(
            Request::get(format!("/sessions/{session_id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let snapshot: SessionSnapshot = read_json(response).await;
    assert_eq!(snapshot.session.phase, Phase::Voting);
    assert_eq!(snapshot.attendance.len(), 1);
}

#[tokio::test]
async fn list_sessions_returns_created_sessions() {
    let (app, _, _) = test_app().await;
    new_session(&app).await;
    new_session(&app).await;

    let response = app
        .oneshot(Request::get("/sessions").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let sessions: Vec<SessionSummary> = read_json(response).await;
    assert_eq!(sessions.len(), 2);
}

#[test]
fn every_error_code_has_a_status() {
    assert_eq!(status_for(ErrorCode::ConcurrentModification), StatusCode::CONFLICT);
    assert_eq!(status_for(ErrorCode::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(status_for(ErrorCode::Internal), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn session_feed_sends_current_state_then_only_that_session() {
    let (app, _, api) = test_app_with(ChangeNotifier::new(1)).await;
    let addr = serve(app).await;
    let watched = create_session(&api).await.expect("session").session_id();
    let other = create_session(&api).await.expect("session").session_id();
    server_api::start_debate(&api, watched).await.expect("debate");

    let (mut feed, _) = connect_async(format!("ws://{addr}/sessions/{}/ws", watched.0))
        .await
        .expect("connect");
    let first = next_snapshot(&mut feed).await;
    assert_eq!(first.session_id(), watched);
    assert_eq!(first.version(), 2);
    assert_eq!(first.session.phase, Phase::Debate);

    // A one-slot buffer makes the handler lag while nothing is read.
    server_api::start_timer(&api, other, 60).await.expect("other timer");
    server_api::start_timer(&api, watched, 300).await.expect("timer");
    server_api::pause_timer(&api, watched).await.expect("pause");
    server_api::start_debate(&api, other).await.expect("other debate");
    server_api::resume_timer(&api, watched).await.expect("resume");
    let latest = server_api::stop_timer(&api, watched).await.expect("stop");
    assert_eq!(latest.snapshot.version(), 6);

    loop {
        let snapshot = next_snapshot(&mut feed).await;
        assert_eq!(snapshot.session_id(), watched);
        assert!(snapshot.version() > 2);
        if snapshot.version() == latest.snapshot.version() {
            assert_eq!(snapshot, latest.snapshot);
            break;
        }
    }
}

#[tokio::test]
async fn session_feed_refuses_unknown_sessions_before_upgrade() {
    let (app, _, _) = test_app().await;
    let addr = serve(app).await;

    let err = connect_async(format!("ws://{addr}/sessions/404/ws"))
        .await
        .expect_err("no such session");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), StatusCode::NOT_FOUND.as_u16())
        }
        other => panic!("unexpected error {other}"),
    }
}
