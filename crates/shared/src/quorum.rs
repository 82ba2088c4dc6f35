use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttendanceRecord, ProxyState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuorumSummary {
    pub base_attendance: i64,
    pub approved_proxy_bonus: i64,
    /// Base rows plus one extra seat per approved proxy.
    pub total_attendees: i64,
    /// Pending proxies, excluded from `total_attendees` until approved.
    pub pending_proxies: i64,
}

pub fn aggregate<'a, I>(attendance: I) -> QuorumSummary
where
    I: IntoIterator<Item = &'a AttendanceRecord>,
{
    let mut summary = QuorumSummary::default();
    for record in attendance {
        summary.base_attendance += 1;
        if !record.is_proxy {
            continue;
        }
        match record.proxy_state {
            ProxyState::Approved => summary.approved_proxy_bonus += 1,
            ProxyState::Pending => summary.pending_proxies += 1,
            ProxyState::Rejected | ProxyState::None => {}
        }
    }
    summary.total_attendees = summary.base_attendance + summary.approved_proxy_bonus;
    summary
}

/// Registration window derived from `entry_close_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryWindow {
    /// No closing time configured.
    Unrestricted,
    Open { remaining_seconds: i64 },
    Closed,
}

impl EntryWindow {
    pub fn at(entry_close_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match entry_close_at {
            None => Self::Unrestricted,
            Some(close_at) if now >= close_at => Self::Closed,
            Some(close_at) => Self::Open {
                remaining_seconds: (close_at - now).num_seconds(),
            },
        }
    }

    pub fn accepts_registration(self) -> bool {
        !matches!(self, Self::Closed)
    }
}
