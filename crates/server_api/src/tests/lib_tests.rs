use super::*;
use chrono::{Duration, TimeZone, Utc};
use shared::{
    clock::ManualClock,
    domain::{Phase, ProposalState, TimerState, VoteTally},
    protocol::ServerEvent,
    timer::remaining,
};
use tokio::sync::broadcast::error::TryRecvError;

async fn setup() -> (ApiContext, Arc<ManualClock>, SessionId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 14, 18, 0, 0)
            .single()
            .expect("valid instant"),
    ));
    let ctx = ApiContext::new(storage, clock.clone(), ChangeNotifier::new(64));
    let session = create_session(&ctx).await.expect("session").session_id();
    (ctx, clock, session)
}

fn assert_consistent(snapshot: &SessionSnapshot) {
    assert_eq!(
        snapshot.invariant_violation(),
        None,
        "version {}",
        snapshot.version()
    );
}

fn next_snapshot(rx: &mut tokio::sync::broadcast::Receiver<ServerEvent>) -> SessionSnapshot {
    match rx.try_recv().expect("event published") {
        ServerEvent::SessionChanged { snapshot } => snapshot,
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn committed_transitions_publish_full_snapshots() {
    let (ctx, _, session) = setup().await;
    let (budget, _) = create_proposal(&ctx, session, "Budget", None)
        .await
        .expect("proposal");
    let mut rx = ctx.notifier.subscribe();

    let debate = start_debate(&ctx, session).await.expect("debate");
    assert!(debate.changed);
    assert_eq!(debate.snapshot.session.phase, Phase::Debate);
    let event = next_snapshot(&mut rx);
    assert_eq!(event, debate.snapshot);

    let voting = open_proposal(&ctx, session, budget.proposal_id)
        .await
        .expect("open");
    assert_eq!(voting.snapshot.session.phase, Phase::Voting);
    assert_eq!(voting.snapshot.version(), debate.snapshot.version() + 1);
    let event = next_snapshot(&mut rx);
    assert_eq!(
        event.open_proposal().map(|p| p.proposal_id),
        Some(budget.proposal_id)
    );
    assert_eq!(event.proposals.len(), 1);
}

#[tokio::test]
async fn rejected_transitions_change_nothing() {
    let (ctx, _, session) = setup().await;
    let before = load_snapshot(&ctx, session).await.expect("snapshot");
    let mut rx = ctx.notifier.subscribe();

    let err = pause_timer(&ctx, session).await.expect_err("not running");
    assert_eq!(err.code, ErrorCode::InvalidTransition);
    let err = start_timer(&ctx, session, -5).await.expect_err("negative");
    assert_eq!(err.code, ErrorCode::Validation);
    let err = start_debate(&ctx, SessionId(999)).await.expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);

    assert_eq!(load_snapshot(&ctx, session).await.expect("snapshot"), before);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn timer_pause_resume_scenario_through_controller() {
    let (ctx, clock, session) = setup().await;
    let t0 = clock.now();

    let started = start_timer(&ctx, session, 300).await.expect("start");
    assert_consistent(&started.snapshot);
    clock.set(t0 + Duration::seconds(125));
    let paused = pause_timer(&ctx, session).await.expect("pause");
    assert_consistent(&paused.snapshot);
    assert_eq!(paused.snapshot.session.timer.state(), TimerState::Paused);
    assert_eq!(remaining(&paused.snapshot.session.timer, clock.now()), 175);

    clock.set(t0 + Duration::seconds(500));
    let view = session_view(&ctx, session).await.expect("view");
    assert_eq!(view.remaining_seconds, 175);

    let resumed = resume_timer(&ctx, session).await.expect("resume");
    assert_consistent(&resumed.snapshot);
    assert_eq!(
        resumed.snapshot.session.timer.started_at,
        Some(t0 + Duration::seconds(375))
    );
    assert_eq!(remaining(&resumed.snapshot.session.timer, clock.now()), 175);

    clock.set(t0 + Duration::seconds(600));
    let view = session_view(&ctx, session).await.expect("view");
    assert_eq!(view.remaining_seconds, 75);

    let stopped = stop_timer(&ctx, session).await.expect("stop");
    assert_consistent(&stopped.snapshot);
    assert_eq!(stopped.snapshot.session.timer.state(), TimerState::Stopped);
    assert_eq!(stopped.snapshot.session.timer.started_at, None);
    assert_eq!(
        stop_timer(&ctx, session).await.expect_err("stopped").code,
        ErrorCode::InvalidTransition
    );
}

#[tokio::test]
async fn close_voting_twice_leaves_tallies_alone() {
    let (ctx, _, session) = setup().await;
    let (budget, _) = create_proposal(&ctx, session, "Budget", Some("2027"))
        .await
        .expect("proposal");
    let (alice, _) = register_attendance(&ctx, session, false)
        .await
        .expect("alice");
    let (bob, _) = register_attendance(&ctx, session, true).await.expect("bob");
    decide_proxy(&ctx, bob.attendance_id, ProxyDecision::Approve)
        .await
        .expect("approve");

    let debate = start_debate(&ctx, session).await.expect("debate");
    assert_consistent(&debate.snapshot);
    let voting = open_proposal(&ctx, session, budget.proposal_id)
        .await
        .expect("open");
    assert_consistent(&voting.snapshot);
    for (voter, choice) in [(alice, VoteChoice::No), (bob, VoteChoice::Yes)] {
        let snapshot = cast_vote(&ctx, budget.proposal_id, voter.attendance_id, choice)
            .await
            .expect("vote");
        assert_consistent(&snapshot);
    }

    let first = close_voting(&ctx, session).await.expect("close");
    assert_consistent(&first.snapshot);
    assert!(first.changed);
    assert_eq!(first.snapshot.session.phase, Phase::Debate);
    let closed = first.snapshot.proposal(budget.proposal_id).expect("budget");
    assert_eq!(closed.state, ProposalState::Closed);
    assert_eq!(closed.tally, VoteTally { yes: 2, no: 1, total: 3 });

    let mut rx = ctx.notifier.subscribe();
    let second = close_voting(&ctx, session).await.expect("noop");
    assert!(!second.changed);
    assert_eq!(second.snapshot, first.snapshot);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    let late = cast_vote(&ctx, budget.proposal_id, alice.attendance_id, VoteChoice::Yes)
        .await
        .expect_err("late vote");
    assert_eq!(late.code, ErrorCode::InvalidTransition);
}

#[tokio::test]
async fn return_to_waiting_preserves_cast_tallies() {
    let (ctx, _, session) = setup().await;
    let (budget, _) = create_proposal(&ctx, session, "Budget", None)
        .await
        .expect("proposal");
    let (alice, _) = register_attendance(&ctx, session, false)
        .await
        .expect("alice");
    assert_consistent(&start_debate(&ctx, session).await.expect("debate").snapshot);
    let voting = open_proposal(&ctx, session, budget.proposal_id)
        .await
        .expect("open");
    assert_consistent(&voting.snapshot);
    let voted = cast_vote(&ctx, budget.proposal_id, alice.attendance_id, VoteChoice::Yes)
        .await
        .expect("vote");
    assert_consistent(&voted);

    let waiting = return_to_waiting(&ctx, session).await.expect("waiting");
    assert_consistent(&waiting.snapshot);
    assert_eq!(waiting.snapshot.session.phase, Phase::Waiting);
    assert!(waiting.snapshot.open_proposal().is_none());
    let record = waiting.snapshot.proposal(budget.proposal_id).expect("budget");
    assert_eq!(record.tally.yes, 1);
}

#[tokio::test]
async fn entry_window_controls_registration() {
    let (ctx, clock, session) = setup().await;
    let err = set_entry_deadline(&ctx, session, clock.now())
        .await
        .expect_err("past deadline");
    assert_eq!(err.code, ErrorCode::Validation);

    set_entry_deadline(&ctx, session, clock.now() + Duration::seconds(90))
        .await
        .expect("deadline");
    register_attendance(&ctx, session, false)
        .await
        .expect("on time");

    clock.advance_seconds(90);
    let err = register_attendance(&ctx, session, true)
        .await
        .expect_err("late");
    assert_eq!(err.code, ErrorCode::InvalidTransition);
    assert_eq!(
        close_entry(&ctx, session).await.expect_err("closed").code,
        ErrorCode::InvalidTransition
    );
}

#[tokio::test]
async fn close_session_is_terminal() {
    let (ctx, _, session) = setup().await;
    let timed = start_timer(&ctx, session, 120).await.expect("timer");
    assert_consistent(&timed.snapshot);
    let closed = close_session(&ctx, session).await.expect("close");
    assert_consistent(&closed.snapshot);
    assert_eq!(closed.snapshot.session.phase, Phase::Closed);
    assert_eq!(closed.snapshot.session.timer.state(), TimerState::Stopped);

    for err in [
        start_debate(&ctx, session).await.expect_err("debate"),
        start_timer(&ctx, session, 10).await.expect_err("timer"),
        close_session(&ctx, session).await.expect_err("close"),
    ] {
        assert_eq!(err.code, ErrorCode::InvalidTransition);
    }
    let err = create_proposal(&ctx, session, "Late", None)
        .await
        .expect_err("proposal");
    assert_eq!(err.code, ErrorCode::InvalidTransition);
}

#[tokio::test]
async fn external_flow_validation() {
    let (ctx, _, session) = setup().await;
    let err = create_proposal(&ctx, session, "   ", None)
        .await
        .expect_err("blank");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = decide_proxy(&ctx, AttendanceId(404), ProxyDecision::Reject)
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);

    let (plain, _) = register_attendance(&ctx, session, false)
        .await
        .expect("plain");
    let err = decide_proxy(&ctx, plain.attendance_id, ProxyDecision::Approve)
        .await
        .expect_err("not a proxy");
    assert_eq!(err.code, ErrorCode::InvalidTransition);
}

#[tokio::test]
async fn retrying_wrapper_passes_through_ordinary_outcomes() {
    let (ctx, _, session) = setup().await;
    let outcome = apply_command_with_retry(&ctx, session, SessionCommand::StartDebate)
        .await
        .expect("debate");
    assert!(outcome.changed);
    let err = apply_command_with_retry(&ctx, session, SessionCommand::StartDebate)
        .await
        .expect_err("already debating");
    assert_eq!(err.code, ErrorCode::InvalidTransition);
}

#[test]
fn store_failures_split_into_unavailable_and_internal() {
    let down = store_error(anyhow::Error::new(sqlx::Error::PoolClosed).context("load session"));
    assert_eq!(down.code, ErrorCode::Unavailable);
    assert!(down.message.starts_with("session store unavailable"));

    let broken = store_error(anyhow::anyhow!("unknown phase 'limbo'"));
    assert_eq!(broken.code, ErrorCode::Internal);
    assert_eq!(broken.message, "unknown phase 'limbo'");
}
