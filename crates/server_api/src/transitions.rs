//! Pure transition planning; the caller commits the plan under a version guard.

use chrono::{DateTime, Utc};
use shared::{
    domain::{Phase, ProposalState, SessionRecord, SessionSnapshot, TimerState},
    error::ApiError,
    protocol::SessionCommand,
    quorum::EntryWindow,
    timer,
};
use storage::ProposalEffect;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Write {
        next: SessionRecord,
        effect: ProposalEffect,
    },
    /// Legal, but there is nothing to change.
    Unchanged,
}

pub fn plan(
    snapshot: &SessionSnapshot,
    command: &SessionCommand,
    now: DateTime<Utc>,
) -> Result<Plan, ApiError> {
    let current = &snapshot.session;
    let mut next = current.clone();
    let mut effect = ProposalEffect::Unchanged;

    match command {
        SessionCommand::CloseVoting => {
            let Some(open) = snapshot.open_proposal() else {
                return Ok(Plan::Unchanged);
            };
            if current.phase != Phase::Voting {
                return Err(ApiError::invalid_transition(format!(
                    "cannot close voting from phase {}",
                    current.phase.as_str()
                )));
            }
            next.phase = Phase::Debate;
            effect = ProposalEffect::Close(open.proposal_id);
        }
        _ if current.phase == Phase::Closed => {
            return Err(ApiError::invalid_transition(format!(
                "session is closed; {} is not allowed",
                command.name()
            )));
        }
        SessionCommand::StartDebate => {
            if !matches!(current.phase, Phase::Waiting | Phase::Voting) {
                return Err(ApiError::invalid_transition(format!(
                    "cannot start debate from phase {}",
                    current.phase.as_str()
                )));
            }
            next.phase = Phase::Debate;
            effect = close_open(snapshot);
        }
        SessionCommand::ReturnToWaiting => {
            next.phase = Phase::Waiting;
            effect = close_open(snapshot);
        }
        SessionCommand::OpenProposal { proposal_id } => {
            if current.phase != Phase::Debate {
                return Err(ApiError::invalid_transition(format!(
                    "proposals can only be opened during debate, not {}",
                    current.phase.as_str()
                )));
            }
            if let Some(open) = snapshot.open_proposal() {
                return Err(ApiError::invalid_transition(format!(
                    "proposal {} is already open",
                    open.proposal_id.0
                )));
            }
            let target = snapshot.proposal(*proposal_id).ok_or_else(|| {
                ApiError::not_found(format!(
                    "proposal {} not found in session {}",
                    proposal_id.0, current.session_id.0
                ))
            })?;
            if target.state != ProposalState::Draft {
                return Err(ApiError::invalid_transition(format!(
                    "proposal {} is {} and cannot be reopened",
                    proposal_id.0,
                    target.state.as_str()
                )));
            }
            next.phase = Phase::Voting;
            effect = ProposalEffect::Open(*proposal_id);
        }
        SessionCommand::StartTimer { duration_seconds } => {
            if *duration_seconds <= 0 {
                return Err(ApiError::validation(format!(
                    "timer duration must be positive, got {duration_seconds}"
                )));
            }
            require_timer(current, TimerState::Stopped, "start")?;
            next.timer = timer::started(*duration_seconds, now);
        }
        SessionCommand::PauseTimer => {
            require_timer(current, TimerState::Running, "pause")?;
            next.timer = timer::paused(&current.timer, now);
        }
        SessionCommand::ResumeTimer => {
            require_timer(current, TimerState::Paused, "resume")?;
            next.timer = timer::resumed(&current.timer, now);
        }
        SessionCommand::StopTimer => {
            if !current.timer.active {
                return Err(ApiError::invalid_transition("timer is already stopped"));
            }
            next.timer = timer::stopped(&current.timer);
        }
        SessionCommand::CloseEntry => {
            if EntryWindow::at(current.entry_close_at, now) == EntryWindow::Closed {
                return Err(ApiError::invalid_transition("entry is already closed"));
            }
            next.entry_close_at = Some(now);
        }
        SessionCommand::SetEntryDeadline { close_at } => {
            if *close_at <= now {
                return Err(ApiError::validation(format!(
                    "entry deadline {close_at} is not in the future"
                )));
            }
            next.entry_close_at = Some(*close_at);
        }
        SessionCommand::CloseSession => {
            next.phase = Phase::Closed;
            next.timer = timer::stopped(&current.timer);
            effect = close_open(snapshot);
        }
    }

    Ok(Plan::Write { next, effect })
}

fn close_open(snapshot: &SessionSnapshot) -> ProposalEffect {
    snapshot
        .open_proposal()
        .map(|open| ProposalEffect::Close(open.proposal_id))
        .unwrap_or(ProposalEffect::Unchanged)
}

fn require_timer(current: &SessionRecord, wanted: TimerState, verb: &str) -> Result<(), ApiError> {
    let state = current.timer.state();
    if state == wanted {
        return Ok(());
    }
    Err(ApiError::invalid_transition(format!(
        "cannot {verb} a {} timer",
        match state {
            TimerState::Stopped => "stopped",
            TimerState::Running => "running",
            TimerState::Paused => "paused",
        }
    )))
}
