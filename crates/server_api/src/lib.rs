pub mod notifier;
pub mod transitions;

use std::sync::Arc;

use shared::{
    clock::Clock,
    domain::{
        AttendanceId, AttendanceRecord, ProposalId, ProposalRecord, SessionId, SessionSnapshot,
        SessionSummary, VoteChoice,
    },
    error::{ApiError, ErrorCode},
    protocol::{CommandOutcome, ProxyDecision, SessionCommand},
    view::{project, SessionView},
};
use storage::{Created, GuardedWrite, Storage};
use tracing::{debug, error, info, warn};

pub use notifier::ChangeNotifier;
use transitions::{plan, Plan};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub clock: Arc<dyn Clock>,
    pub notifier: ChangeNotifier,
}

impl ApiContext {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, notifier: ChangeNotifier) -> Self {
        Self {
            storage,
            clock,
            notifier,
        }
    }
}

pub async fn create_session(ctx: &ApiContext) -> Result<SessionSnapshot, ApiError> {
    let session_id = ctx.storage.create_session().await.map_err(store_error)?;
    let snapshot = load_snapshot(ctx, session_id).await?;
    info!(session_id = session_id.0, "session created");
    ctx.notifier.publish(&snapshot);
    Ok(snapshot)
}

pub async fn list_sessions(ctx: &ApiContext) -> Result<Vec<SessionSummary>, ApiError> {
    ctx.storage.list_sessions().await.map_err(store_error)
}

pub async fn load_snapshot(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<SessionSnapshot, ApiError> {
    ctx.storage
        .load_snapshot(session_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found(format!("session {} not found", session_id.0)))
}

/// Projection of the current snapshot at the controller's clock.
pub async fn session_view(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<SessionView, ApiError> {
    let snapshot = load_snapshot(ctx, session_id).await?;
    Ok(project(&snapshot, ctx.clock.now()))
}

/// Validates `command` against the latest snapshot and commits it guarded by
/// the version that snapshot was read at.
pub async fn apply_command(
    ctx: &ApiContext,
    session_id: SessionId,
    command: SessionCommand,
) -> Result<CommandOutcome, ApiError> {
    let snapshot = load_snapshot(ctx, session_id).await?;
    let expected_version = snapshot.version();

    let planned = plan(&snapshot, &command, ctx.clock.now()).inspect_err(|err| {
        debug!(
            session_id = session_id.0,
            version = expected_version,
            command = command.name(),
            error = %err,
            "transition rejected"
        );
    })?;
    let (next, effect) = match planned {
        Plan::Unchanged => {
            debug!(
                session_id = session_id.0,
                command = command.name(),
                "transition is a no-op"
            );
            return Ok(CommandOutcome {
                changed: false,
                snapshot,
            });
        }
        Plan::Write { next, effect } => (next, effect),
    };

    let write = ctx
        .storage
        .commit_transition(&next, expected_version, effect)
        .await
        .map_err(store_error)?;
    let snapshot = settle(session_id, command.name(), expected_version, write)?;
    info!(
        session_id = session_id.0,
        version = snapshot.version(),
        phase = snapshot.session.phase.as_str(),
        command = command.name(),
        "transition committed"
    );
    ctx.notifier.publish(&snapshot);
    Ok(CommandOutcome {
        changed: true,
        snapshot,
    })
}

/// [`apply_command`], refetching and retrying exactly once when the session
/// moved underneath the first attempt.
pub async fn apply_command_with_retry(
    ctx: &ApiContext,
    session_id: SessionId,
    command: SessionCommand,
) -> Result<CommandOutcome, ApiError> {
    match apply_command(ctx, session_id, command.clone()).await {
        Err(err) if err.code == ErrorCode::ConcurrentModification => {
            debug!(
                session_id = session_id.0,
                command = command.name(),
                "retrying after concurrent modification"
            );
            apply_command(ctx, session_id, command).await
        }
        other => other,
    }
}

pub async fn start_debate(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::StartDebate).await
}

pub async fn return_to_waiting(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::ReturnToWaiting).await
}

pub async fn open_proposal(
    ctx: &ApiContext,
    session_id: SessionId,
    proposal_id: ProposalId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::OpenProposal { proposal_id }).await
}

pub async fn close_voting(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::CloseVoting).await
}

pub async fn start_timer(
    ctx: &ApiContext,
    session_id: SessionId,
    duration_seconds: i64,
) -> Result<CommandOutcome, ApiError> {
    apply_command(
        ctx,
        session_id,
        SessionCommand::StartTimer { duration_seconds },
    )
    .await
}

pub async fn pause_timer(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::PauseTimer).await
}

pub async fn resume_timer(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::ResumeTimer).await
}

pub async fn stop_timer(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::StopTimer).await
}

pub async fn close_entry(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::CloseEntry).await
}

pub async fn set_entry_deadline(
    ctx: &ApiContext,
    session_id: SessionId,
    close_at: chrono::DateTime<chrono::Utc>,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::SetEntryDeadline { close_at }).await
}

pub async fn close_session(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<CommandOutcome, ApiError> {
    apply_command(ctx, session_id, SessionCommand::CloseSession).await
}

pub async fn create_proposal(
    ctx: &ApiContext,
    session_id: SessionId,
    title: &str,
    description: Option<&str>,
) -> Result<(ProposalRecord, SessionSnapshot), ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::validation("proposal title cannot be empty"));
    }
    let description = description.map(str::trim).filter(|d| !d.is_empty());

    let write = ctx
        .storage
        .create_proposal(session_id, title, description)
        .await
        .map_err(store_error)?;
    let Created { record, snapshot } =
        settle_flow("create_proposal", &format!("session {}", session_id.0), write)?;
    info!(
        session_id = session_id.0,
        proposal_id = record.proposal_id.0,
        version = snapshot.version(),
        "proposal created"
    );
    ctx.notifier.publish(&snapshot);
    Ok((record, snapshot))
}

pub async fn register_attendance(
    ctx: &ApiContext,
    session_id: SessionId,
    is_proxy: bool,
) -> Result<(AttendanceRecord, SessionSnapshot), ApiError> {
    let write = ctx
        .storage
        .register_attendance(session_id, is_proxy, ctx.clock.now())
        .await
        .map_err(store_error)?;
    let Created { record, snapshot } =
        settle_flow("register_attendance", &format!("session {}", session_id.0), write)?;
    info!(
        session_id = session_id.0,
        attendance_id = record.attendance_id.0,
        is_proxy,
        version = snapshot.version(),
        "attendance registered"
    );
    ctx.notifier.publish(&snapshot);
    Ok((record, snapshot))
}

pub async fn decide_proxy(
    ctx: &ApiContext,
    attendance_id: AttendanceId,
    decision: ProxyDecision,
) -> Result<SessionSnapshot, ApiError> {
    let approve = decision == ProxyDecision::Approve;
    let write = ctx
        .storage
        .decide_proxy(attendance_id, approve)
        .await
        .map_err(store_error)?;
    let snapshot = settle_flow(
        "decide_proxy",
        &format!("attendance {}", attendance_id.0),
        write,
    )?;
    info!(
        session_id = snapshot.session_id().0,
        attendance_id = attendance_id.0,
        approve,
        version = snapshot.version(),
        "proxy decided"
    );
    ctx.notifier.publish(&snapshot);
    Ok(snapshot)
}

pub async fn cast_vote(
    ctx: &ApiContext,
    proposal_id: ProposalId,
    attendance_id: AttendanceId,
    choice: VoteChoice,
) -> Result<SessionSnapshot, ApiError> {
    let write = ctx
        .storage
        .cast_vote(proposal_id, attendance_id, choice)
        .await
        .map_err(store_error)?;
    let snapshot = settle_flow(
        "cast_vote",
        &format!("proposal {} or attendance {}", proposal_id.0, attendance_id.0),
        write,
    )?;
    debug!(
        session_id = snapshot.session_id().0,
        proposal_id = proposal_id.0,
        attendance_id = attendance_id.0,
        version = snapshot.version(),
        "vote recorded"
    );
    ctx.notifier.publish(&snapshot);
    Ok(snapshot)
}

fn settle(
    session_id: SessionId,
    command: &str,
    expected_version: i64,
    write: GuardedWrite<SessionSnapshot>,
) -> Result<SessionSnapshot, ApiError> {
    match write {
        GuardedWrite::Committed(snapshot) => Ok(snapshot),
        GuardedWrite::Stale => {
            warn!(
                session_id = session_id.0,
                version = expected_version,
                command,
                "guarded write lost to a concurrent change"
            );
            Err(ApiError::concurrent_modification(format!(
                "session {} changed after version {expected_version}; refetch and retry",
                session_id.0
            )))
        }
        GuardedWrite::Rejected(reason) => {
            debug!(session_id = session_id.0, command, %reason, "transition rejected by store");
            Err(ApiError::invalid_transition(reason))
        }
        GuardedWrite::Invalid(reason) => Err(ApiError::validation(reason)),
        GuardedWrite::Missing => Err(ApiError::not_found(format!(
            "session {} not found",
            session_id.0
        ))),
    }
}

fn settle_flow<T>(flow: &str, subject: &str, write: GuardedWrite<T>) -> Result<T, ApiError> {
    match write {
        GuardedWrite::Committed(value) => Ok(value),
        GuardedWrite::Rejected(reason) => {
            debug!(flow, subject, %reason, "flow rejected");
            Err(ApiError::invalid_transition(reason))
        }
        GuardedWrite::Invalid(reason) => Err(ApiError::validation(reason)),
        GuardedWrite::Missing => Err(ApiError::not_found(format!("{subject} not found"))),
        GuardedWrite::Stale => Err(ApiError::concurrent_modification(format!(
            "{subject} changed during {flow}"
        ))),
    }
}

fn store_error(err: anyhow::Error) -> ApiError {
    if storage::is_unavailable(&err) {
        warn!(error = %err, "session store unavailable");
        ApiError::unavailable(format!("session store unavailable: {err}"))
    } else {
        error!(error = %err, "session store failure");
        ApiError::internal(err.to_string())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
