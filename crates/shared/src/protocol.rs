use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AttendanceId, AttendanceRecord, ProposalId, SessionId, SessionSnapshot, VoteChoice},
    error::ApiError,
};

/// Every controller operation, as carried over `POST /sessions/:id/commands`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionCommand {
    StartDebate,
    ReturnToWaiting,
    OpenProposal { proposal_id: ProposalId },
    CloseVoting,
    StartTimer { duration_seconds: i64 },
    PauseTimer,
    ResumeTimer,
    StopTimer,
    CloseEntry,
    SetEntryDeadline { close_at: DateTime<Utc> },
    CloseSession,
}

impl SessionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartDebate => "start_debate",
            Self::ReturnToWaiting => "return_to_waiting",
            Self::OpenProposal { .. } => "open_proposal",
            Self::CloseVoting => "close_voting",
            Self::StartTimer { .. } => "start_timer",
            Self::PauseTimer => "pause_timer",
            Self::ResumeTimer => "resume_timer",
            Self::StopTimer => "stop_timer",
            Self::CloseEntry => "close_entry",
            Self::SetEntryDeadline { .. } => "set_entry_deadline",
            Self::CloseSession => "close_session",
        }
    }
}

/// Result of a controller call. `changed` is false for idempotent no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub changed: bool,
    pub snapshot: SessionSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProposalRequest {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAttendanceRequest {
    #[serde(default)]
    pub is_proxy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAttendanceResponse {
    pub attendance: AttendanceRecord,
    pub snapshot: SessionSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDecisionRequest {
    pub decision: ProxyDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVoteRequest {
    pub attendance_id: AttendanceId,
    pub choice: VoteChoice,
}

/// Change-feed message. Payloads are always complete snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionChanged { snapshot: SessionSnapshot },
    Error(ApiError),
}

impl ServerEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::SessionChanged { snapshot } => Some(snapshot.session_id()),
            Self::Error(_) => None,
        }
    }
}
