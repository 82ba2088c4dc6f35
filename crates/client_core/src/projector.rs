use chrono::{DateTime, Utc};
use shared::{
    domain::{SessionId, SessionSnapshot},
    view::{project, SessionView},
};

/// What happened to a snapshot handed to [`SessionProjector::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    /// Version not newer than the one already held.
    Stale,
    ForeignSession,
}

/// Latest-snapshot reducer for one session.
///
/// Only ever holds a complete snapshot. Views are recomputed from it and a
/// clock reading on demand, so nothing accumulates between calls.
#[derive(Debug, Clone)]
pub struct SessionProjector {
    session_id: SessionId,
    latest: Option<SessionSnapshot>,
}

impl SessionProjector {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            latest: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn version(&self) -> Option<i64> {
        self.latest.as_ref().map(SessionSnapshot::version)
    }

    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        self.latest.as_ref()
    }

    /// Keeps `snapshot` only if it is strictly newer than what is held.
    pub fn apply(&mut self, snapshot: SessionSnapshot) -> Applied {
        if snapshot.session_id() != self.session_id {
            return Applied::ForeignSession;
        }
        if let Some(current) = self.version() {
            if snapshot.version() <= current {
                return Applied::Stale;
            }
        }
        self.latest = Some(snapshot);
        Applied::Accepted
    }

    /// Replaces the held snapshot with one fetched directly from the store,
    /// regardless of version.
    pub fn resync(&mut self, snapshot: SessionSnapshot) -> Applied {
        if snapshot.session_id() != self.session_id {
            return Applied::ForeignSession;
        }
        self.latest = Some(snapshot);
        Applied::Accepted
    }

    pub fn view(&self, now: DateTime<Utc>) -> Option<SessionView> {
        self.latest.as_ref().map(|snapshot| project(snapshot, now))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use shared::{
        domain::{Phase, SessionRecord, TimerRecord},
        timer,
    };

    use super::*;

    fn snapshot(session: i64, version: i64, phase: Phase) -> SessionSnapshot {
        SessionSnapshot {
            session: SessionRecord {
                session_id: SessionId(session),
                phase,
                entry_close_at: None,
                timer: TimerRecord::default(),
                version,
            },
            proposals: Vec::new(),
            attendance: Vec::new(),
        }
    }

    #[test]
    fn discards_versions_that_are_not_newer() {
        let mut projector = SessionProjector::new(SessionId(1));
        assert_eq!(projector.apply(snapshot(1, 4, Phase::Debate)), Applied::Accepted);
        assert_eq!(projector.apply(snapshot(1, 3, Phase::Waiting)), Applied::Stale);
        assert_eq!(projector.apply(snapshot(1, 4, Phase::Waiting)), Applied::Stale);
        assert_eq!(projector.apply(snapshot(2, 9, Phase::Voting)), Applied::ForeignSession);
        assert_eq!(projector.version(), Some(4));
        assert_eq!(
            projector.snapshot().map(|s| s.session.phase),
            Some(Phase::Debate)
        );

        assert_eq!(projector.apply(snapshot(1, 7, Phase::Voting)), Applied::Accepted);
        assert_eq!(projector.version(), Some(7));
    }

    #[test]
    fn resync_replaces_unconditionally() {
        let mut projector = SessionProjector::new(SessionId(1));
        projector.apply(snapshot(1, 10, Phase::Voting));
        assert_eq!(projector.resync(snapshot(1, 8, Phase::Waiting)), Applied::Accepted);
        assert_eq!(projector.version(), Some(8));
    }

    #[test]
    fn view_is_recomputed_from_the_anchor_each_time() {
        let t0 = Utc
            .with_ymd_and_hms(2026, 3, 14, 18, 0, 0)
            .single()
            .expect("valid instant");
        let mut projector = SessionProjector::new(SessionId(1));
        assert!(projector.view(t0).is_none());

        let mut running = snapshot(1, 2, Phase::Debate);
        running.session.timer = timer::started(90, t0);
        projector.apply(running);

        let early = projector.view(t0 + Duration::seconds(10)).expect("view");
        let late = projector.view(t0 + Duration::seconds(200)).expect("view");
        let back = projector.view(t0 + Duration::seconds(30)).expect("view");
        assert_eq!(early.remaining_seconds, 80);
        assert_eq!(late.remaining_seconds, 0);
        assert_eq!(back.remaining_seconds, 60);
    }
}
