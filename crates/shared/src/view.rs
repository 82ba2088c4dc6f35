use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Phase, ProposalRecord, SessionId, SessionSnapshot, TimerState},
    quorum::{aggregate, EntryWindow, QuorumSummary},
    timer::remaining,
};

/// What an observer displays: a pure function of a snapshot and a clock reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub version: i64,
    pub phase: Phase,
    pub timer_state: TimerState,
    pub remaining_seconds: i64,
    pub duration_seconds: i64,
    pub quorum: QuorumSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_proposal: Option<ProposalRecord>,
    pub proposal_count: usize,
    pub entry: EntryWindow,
}

pub fn project(snapshot: &SessionSnapshot, now: DateTime<Utc>) -> SessionView {
    let session = &snapshot.session;
    SessionView {
        session_id: session.session_id,
        version: session.version,
        phase: session.phase,
        timer_state: session.timer.state(),
        remaining_seconds: remaining(&session.timer, now),
        duration_seconds: session.timer.duration_seconds,
        quorum: aggregate(&snapshot.attendance),
        open_proposal: snapshot.open_proposal().cloned(),
        proposal_count: snapshot.proposals.len(),
        entry: EntryWindow::at(session.entry_close_at, now),
    }
}

/// `mm:ss` rendering used by the CLIs.
pub fn format_clock(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
