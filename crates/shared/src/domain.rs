use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(SessionId);
id_newtype!(ProposalId);
id_newtype!(AttendanceId);
id_newtype!(VoteId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    Debate,
    Voting,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Debate => "debate",
            Self::Voting => "voting",
            Self::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(Self::Waiting),
            "debate" => Some(Self::Debate),
            "voting" => Some(Self::Voting),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Draft,
    Open,
    Closed,
}

impl ProposalState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(Self::Draft),
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    None,
    Pending,
    Approved,
    Rejected,
}

impl ProxyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Yes,
    No,
}

impl VoteChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            _ => None,
        }
    }
}

/// Derived from the stored `active`/`paused` flags; never persisted itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Stopped,
    Running,
    Paused,
}

/// Authoritative countdown record. `duration_seconds == 0` means the timer was
/// never configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub active: bool,
    pub paused: bool,
    pub duration_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub paused_elapsed_seconds: i64,
}

impl Default for TimerRecord {
    fn default() -> Self {
        Self::stopped(0)
    }
}

impl TimerRecord {
    pub fn stopped(duration_seconds: i64) -> Self {
        Self {
            active: false,
            paused: false,
            duration_seconds,
            started_at: None,
            paused_elapsed_seconds: 0,
        }
    }

    pub fn state(&self) -> TimerState {
        match (self.active, self.paused) {
            (false, _) => TimerState::Stopped,
            (true, false) => TimerState::Running,
            (true, true) => TimerState::Paused,
        }
    }

    /// Returns a description of the first violated invariant, if any.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        if !self.active && self.started_at.is_some() {
            return Some("stopped timer carries a start anchor");
        }
        if self.paused && !self.active {
            return Some("paused timer is not active");
        }
        if self.active && self.started_at.is_none() {
            return Some("active timer has no start anchor");
        }
        if self.active && self.duration_seconds <= 0 {
            return Some("active timer has a non-positive duration");
        }
        if self.paused_elapsed_seconds < 0 {
            return Some("negative banked elapsed time");
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_close_at: Option<DateTime<Utc>>,
    pub timer: TimerRecord,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteTally {
    pub yes: i64,
    pub no: i64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub proposal_id: ProposalId,
    pub session_id: SessionId,
    pub order: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub state: ProposalState,
    pub tally: VoteTally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub attendance_id: AttendanceId,
    pub session_id: SessionId,
    pub is_proxy: bool,
    pub proxy_state: ProxyState,
}

impl AttendanceRecord {
    /// Voting weight carried into tallies: an approved proxy votes for two.
    pub fn vote_weight(&self) -> i64 {
        if self.is_proxy && self.proxy_state == ProxyState::Approved {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub vote_id: VoteId,
    pub proposal_id: ProposalId,
    pub attendance_id: AttendanceId,
    pub choice: VoteChoice,
}

/// Complete state of one session as delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: SessionRecord,
    #[serde(default)]
    pub proposals: Vec<ProposalRecord>,
    #[serde(default)]
    pub attendance: Vec<AttendanceRecord>,
}

impl SessionSnapshot {
    pub fn session_id(&self) -> SessionId {
        self.session.session_id
    }

    pub fn version(&self) -> i64 {
        self.session.version
    }

    pub fn open_proposal(&self) -> Option<&ProposalRecord> {
        self.proposals
            .iter()
            .find(|proposal| proposal.state == ProposalState::Open)
    }

    pub fn proposal(&self, proposal_id: ProposalId) -> Option<&ProposalRecord> {
        self.proposals
            .iter()
            .find(|proposal| proposal.proposal_id == proposal_id)
    }

    /// Checks the invariants every observed snapshot must satisfy.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        if let Some(violation) = self.session.timer.invariant_violation() {
            return Some(violation);
        }
        let open = self
            .proposals
            .iter()
            .filter(|proposal| proposal.state == ProposalState::Open)
            .count();
        if open > 1 {
            return Some("more than one open proposal");
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub phase: Phase,
    pub version: i64,
}
