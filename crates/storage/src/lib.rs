use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::{
    domain::{
        AttendanceId, AttendanceRecord, Phase, ProposalId, ProposalRecord, ProposalState,
        ProxyState, SessionId, SessionRecord, SessionSnapshot, SessionSummary, TimerRecord,
        VoteChoice, VoteId, VoteRecord, VoteTally,
    },
    quorum::EntryWindow,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Outcome of a write that is conditioned on the state it read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardedWrite<T> {
    Committed(T),
    /// The session version moved since it was read; nothing was written.
    Stale,
    /// A row-level precondition failed inside the transaction.
    Rejected(String),
    /// The request referenced rows that do not fit together.
    Invalid(String),
    Missing,
}

/// Proposal row change applied in the same transaction as a session write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalEffect {
    Unchanged,
    /// DRAFT -> OPEN.
    Open(ProposalId),
    /// OPEN -> CLOSED with tallies finalized from cast votes.
    Close(ProposalId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created<T> {
    pub record: T,
    pub snapshot: SessionSnapshot,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        if sqlite_path(database_url).is_some() {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_session(&self) -> Result<SessionId> {
        let rec = sqlx::query("INSERT INTO sessions DEFAULT VALUES RETURNING id")
            .fetch_one(&self.pool)
            .await?;
        Ok(SessionId(rec.get::<i64, _>(0)))
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query("SELECT id, phase, version FROM sessions ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(SessionSummary {
                    session_id: SessionId(r.try_get::<i64, _>(0)?),
                    phase: parse_phase(&r.try_get::<String, _>(1)?)?,
                    version: r.try_get::<i64, _>(2)?,
                })
            })
            .collect()
    }

    /// Reads the session with its proposals and attendance as of one point in time.
    pub async fn load_snapshot(&self, session_id: SessionId) -> Result<Option<SessionSnapshot>> {
        let mut tx = self.pool.begin().await?;
        let snapshot = read_snapshot(&mut tx, session_id).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    /// Writes `next` only if the stored version still equals `expected_version`,
    /// bumping the version and applying `effect` atomically.
    pub async fn commit_transition(
        &self,
        next: &SessionRecord,
        expected_version: i64,
        effect: ProposalEffect,
    ) -> Result<GuardedWrite<SessionSnapshot>> {
        let session_id = next.session_id;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE sessions SET
                phase = ?,
                entry_close_at = ?,
                timer_active = ?,
                timer_paused = ?,
                timer_duration_seconds = ?,
                timer_started_at = ?,
                timer_paused_elapsed_seconds = ?,
                version = version + 1,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND version = ?",
        )
        .bind(next.phase.as_str())
        .bind(next.entry_close_at)
        .bind(next.timer.active)
        .bind(next.timer.paused)
        .bind(next.timer.duration_seconds)
        .bind(next.timer.started_at)
        .bind(next.timer.paused_elapsed_seconds)
        .bind(session_id.0)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Ok(GuardedWrite::Stale);
        }

        match effect {
            ProposalEffect::Unchanged => {}
            ProposalEffect::Open(proposal_id) => {
                let opened = sqlx::query(
                    "UPDATE proposals SET state = 'open'
                     WHERE id = ? AND session_id = ? AND state = 'draft'",
                )
                .bind(proposal_id.0)
                .bind(session_id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if opened == 0 {
                    tx.rollback().await?;
                    return Ok(GuardedWrite::Rejected(format!(
                        "proposal {} is not a draft of session {}",
                        proposal_id.0, session_id.0
                    )));
                }
            }
            ProposalEffect::Close(proposal_id) => {
                let tally = tally_votes_in(&mut tx, proposal_id).await?;
                let closed = sqlx::query(
                    "UPDATE proposals
                     SET state = 'closed', votes_yes = ?, votes_no = ?, votes_total = ?
                     WHERE id = ? AND session_id = ? AND state = 'open'",
                )
                .bind(tally.yes)
                .bind(tally.no)
                .bind(tally.total)
                .bind(proposal_id.0)
                .bind(session_id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if closed == 0 {
                    tx.rollback().await?;
                    return Ok(GuardedWrite::Rejected(format!(
                        "proposal {} is not open in session {}",
                        proposal_id.0, session_id.0
                    )));
                }
            }
        }

        let snapshot = read_snapshot(&mut tx, session_id)
            .await?
            .ok_or_else(|| anyhow!("session {} vanished during commit", session_id.0))?;
        tx.commit().await?;
        Ok(GuardedWrite::Committed(snapshot))
    }

    /// Adds a DRAFT proposal at the end of the session's agenda.
    pub async fn create_proposal(
        &self,
        session_id: SessionId,
        title: &str,
        description: Option<&str>,
    ) -> Result<GuardedWrite<Created<ProposalRecord>>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = bump_session_version(&mut tx, session_id).await? else {
            tx.rollback().await?;
            return Ok(GuardedWrite::Missing);
        };
        if parse_phase(&row.try_get::<String, _>("phase")?)? == Phase::Closed {
            tx.rollback().await?;
            return Ok(GuardedWrite::Rejected("session is closed".into()));
        }

        let rec = sqlx::query(
            "INSERT INTO proposals (session_id, order_index, title, description)
             VALUES (?, (SELECT COALESCE(MAX(order_index), 0) + 1 FROM proposals WHERE session_id = ?), ?, ?)
             RETURNING id",
        )
        .bind(session_id.0)
        .bind(session_id.0)
        .bind(title)
        .bind(description)
        .fetch_one(&mut *tx)
        .await?;
        let proposal_id = ProposalId(rec.get::<i64, _>(0));

        let snapshot = read_snapshot(&mut tx, session_id)
            .await?
            .ok_or_else(|| anyhow!("session {} vanished during insert", session_id.0))?;
        tx.commit().await?;
        let record = snapshot
            .proposal(proposal_id)
            .cloned()
            .ok_or_else(|| anyhow!("proposal {} missing after insert", proposal_id.0))?;
        Ok(GuardedWrite::Committed(Created { record, snapshot }))
    }

    /// Registers an attendee unless the session is closed or its entry window
    /// has passed at `now`. Proxies start PENDING.
    pub async fn register_attendance(
        &self,
        session_id: SessionId,
        is_proxy: bool,
        now: DateTime<Utc>,
    ) -> Result<GuardedWrite<Created<AttendanceRecord>>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = bump_session_version(&mut tx, session_id).await? else {
            tx.rollback().await?;
            return Ok(GuardedWrite::Missing);
        };
        if parse_phase(&row.try_get::<String, _>("phase")?)? == Phase::Closed {
            tx.rollback().await?;
            return Ok(GuardedWrite::Rejected("session is closed".into()));
        }
        let entry_close_at: Option<DateTime<Utc>> = row.try_get("entry_close_at")?;
        if !EntryWindow::at(entry_close_at, now).accepts_registration() {
            tx.rollback().await?;
            return Ok(GuardedWrite::Rejected("entry window is closed".into()));
        }

        let proxy_state = if is_proxy {
            ProxyState::Pending
        } else {
            ProxyState::None
        };
        let rec = sqlx::query(
            "INSERT INTO attendance (session_id, is_proxy, proxy_state) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(session_id.0)
        .bind(is_proxy)
        .bind(proxy_state.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let record = AttendanceRecord {
            attendance_id: AttendanceId(rec.get::<i64, _>(0)),
            session_id,
            is_proxy,
            proxy_state,
        };

        let snapshot = read_snapshot(&mut tx, session_id)
            .await?
            .ok_or_else(|| anyhow!("session {} vanished during insert", session_id.0))?;
        tx.commit().await?;
        Ok(GuardedWrite::Committed(Created { record, snapshot }))
    }

    /// Moves a PENDING proxy to APPROVED or REJECTED.
    pub async fn decide_proxy(
        &self,
        attendance_id: AttendanceId,
        approve: bool,
    ) -> Result<GuardedWrite<SessionSnapshot>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE sessions SET version = version + 1, updated_at = CURRENT_TIMESTAMP
             WHERE id = (SELECT session_id FROM attendance WHERE id = ?)
             RETURNING id, phase",
        )
        .bind(attendance_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(GuardedWrite::Missing);
        };
        let session_id = SessionId(row.try_get::<i64, _>("id")?);
        if parse_phase(&row.try_get::<String, _>("phase")?)? == Phase::Closed {
            tx.rollback().await?;
            return Ok(GuardedWrite::Rejected("session is closed".into()));
        }

        let decided = if approve {
            ProxyState::Approved
        } else {
            ProxyState::Rejected
        };
        let updated = sqlx::query(
            "UPDATE attendance SET proxy_state = ?
             WHERE id = ? AND is_proxy = 1 AND proxy_state = 'pending'",
        )
        .bind(decided.as_str())
        .bind(attendance_id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Ok(GuardedWrite::Rejected(format!(
                "attendance {} is not a pending proxy",
                attendance_id.0
            )));
        }

        let snapshot = read_snapshot(&mut tx, session_id)
            .await?
            .ok_or_else(|| anyhow!("session {} vanished during update", session_id.0))?;
        tx.commit().await?;
        Ok(GuardedWrite::Committed(snapshot))
    }

    /// Records or overwrites the vote of one attendee on an OPEN proposal.
    pub async fn cast_vote(
        &self,
        proposal_id: ProposalId,
        attendance_id: AttendanceId,
        choice: VoteChoice,
    ) -> Result<GuardedWrite<SessionSnapshot>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE sessions SET version = version + 1, updated_at = CURRENT_TIMESTAMP
             WHERE id = (SELECT session_id FROM proposals WHERE id = ?)
             RETURNING id",
        )
        .bind(proposal_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(GuardedWrite::Missing);
        };
        let session_id = SessionId(row.try_get::<i64, _>("id")?);

        let context = sqlx::query(
            "SELECT p.state, (SELECT a.session_id FROM attendance a WHERE a.id = ?)
             FROM proposals p WHERE p.id = ?",
        )
        .bind(attendance_id.0)
        .bind(proposal_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let state = parse_proposal_state(&context.try_get::<String, _>(0)?)?;
        let attendee_session: Option<i64> = context.try_get(1)?;
        match attendee_session {
            None => {
                tx.rollback().await?;
                return Ok(GuardedWrite::Missing);
            }
            Some(attendee_session) if attendee_session != session_id.0 => {
                tx.rollback().await?;
                return Ok(GuardedWrite::Invalid(format!(
                    "attendance {} does not belong to session {}",
                    attendance_id.0, session_id.0
                )));
            }
            Some(_) => {}
        }
        if state != ProposalState::Open {
            tx.rollback().await?;
            return Ok(GuardedWrite::Rejected(format!(
                "proposal {} is not open for voting",
                proposal_id.0
            )));
        }

        sqlx::query(
            "INSERT INTO votes (proposal_id, attendance_id, choice) VALUES (?, ?, ?)
             ON CONFLICT(proposal_id, attendance_id) DO UPDATE SET
                choice = excluded.choice,
                cast_at = CURRENT_TIMESTAMP",
        )
        .bind(proposal_id.0)
        .bind(attendance_id.0)
        .bind(choice.as_str())
        .execute(&mut *tx)
        .await?;

        let snapshot = read_snapshot(&mut tx, session_id)
            .await?
            .ok_or_else(|| anyhow!("session {} vanished during vote", session_id.0))?;
        tx.commit().await?;
        Ok(GuardedWrite::Committed(snapshot))
    }

    pub async fn list_votes(&self, proposal_id: ProposalId) -> Result<Vec<VoteRecord>> {
        let rows = sqlx::query(
            "SELECT id, proposal_id, attendance_id, choice FROM votes WHERE proposal_id = ? ORDER BY id",
        )
        .bind(proposal_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let raw: String = r.try_get(3)?;
                Ok(VoteRecord {
                    vote_id: VoteId(r.try_get::<i64, _>(0)?),
                    proposal_id: ProposalId(r.try_get::<i64, _>(1)?),
                    attendance_id: AttendanceId(r.try_get::<i64, _>(2)?),
                    choice: VoteChoice::parse(&raw)
                        .ok_or_else(|| anyhow!("unknown vote choice '{raw}'"))?,
                })
            })
            .collect()
    }

    /// Weighted tally of the votes currently cast on a proposal.
    pub async fn tally_votes(&self, proposal_id: ProposalId) -> Result<VoteTally> {
        let mut conn = self.pool.acquire().await?;
        tally_votes_in(&mut conn, proposal_id).await
    }
}

/// True when the error means the store could not be reached at all.
pub fn is_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_))
        )
    })
}

async fn bump_session_version(
    conn: &mut SqliteConnection,
    session_id: SessionId,
) -> Result<Option<SqliteRow>> {
    let row = sqlx::query(
        "UPDATE sessions SET version = version + 1, updated_at = CURRENT_TIMESTAMP
         WHERE id = ?
         RETURNING phase, entry_close_at",
    )
    .bind(session_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn read_snapshot(
    conn: &mut SqliteConnection,
    session_id: SessionId,
) -> Result<Option<SessionSnapshot>> {
    let row = sqlx::query(
        "SELECT id, phase, entry_close_at, timer_active, timer_paused, timer_duration_seconds,
                timer_started_at, timer_paused_elapsed_seconds, version
         FROM sessions WHERE id = ?",
    )
    .bind(session_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let session = session_from_row(&row)?;

    let proposals = sqlx::query(
        "SELECT id, session_id, order_index, title, description, state, votes_yes, votes_no, votes_total
         FROM proposals WHERE session_id = ?
         ORDER BY order_index ASC",
    )
    .bind(session_id.0)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(proposal_from_row)
    .collect::<Result<Vec<_>>>()?;

    let attendance = sqlx::query(
        "SELECT id, session_id, is_proxy, proxy_state FROM attendance WHERE session_id = ? ORDER BY id",
    )
    .bind(session_id.0)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(attendance_from_row)
    .collect::<Result<Vec<_>>>()?;

    Ok(Some(SessionSnapshot {
        session,
        proposals,
        attendance,
    }))
}

async fn tally_votes_in(conn: &mut SqliteConnection, proposal_id: ProposalId) -> Result<VoteTally> {
    let rows = sqlx::query(
        "SELECT v.choice, a.id, a.session_id, a.is_proxy, a.proxy_state
         FROM votes v
         INNER JOIN attendance a ON a.id = v.attendance_id
         WHERE v.proposal_id = ?",
    )
    .bind(proposal_id.0)
    .fetch_all(&mut *conn)
    .await?;

    let mut tally = VoteTally::default();
    for row in &rows {
        let weight = attendance_from_row(row)?.vote_weight();
        let raw: String = row.try_get("choice")?;
        match VoteChoice::parse(&raw).ok_or_else(|| anyhow!("unknown vote choice '{raw}'"))? {
            VoteChoice::Yes => tally.yes += weight,
            VoteChoice::No => tally.no += weight,
        }
    }
    tally.total = tally.yes + tally.no;
    Ok(tally)
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
    Ok(SessionRecord {
        session_id: SessionId(row.try_get("id")?),
        phase: parse_phase(&row.try_get::<String, _>("phase")?)?,
        entry_close_at: row.try_get("entry_close_at")?,
        timer: TimerRecord {
            active: row.try_get("timer_active")?,
            paused: row.try_get("timer_paused")?,
            duration_seconds: row.try_get("timer_duration_seconds")?,
            started_at: row.try_get("timer_started_at")?,
            paused_elapsed_seconds: row.try_get("timer_paused_elapsed_seconds")?,
        },
        version: row.try_get("version")?,
    })
}

fn proposal_from_row(row: &SqliteRow) -> Result<ProposalRecord> {
    Ok(ProposalRecord {
        proposal_id: ProposalId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        order: row.try_get("order_index")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        state: parse_proposal_state(&row.try_get::<String, _>("state")?)?,
        tally: VoteTally {
            yes: row.try_get("votes_yes")?,
            no: row.try_get("votes_no")?,
            total: row.try_get("votes_total")?,
        },
    })
}

fn attendance_from_row(row: &SqliteRow) -> Result<AttendanceRecord> {
    let raw: String = row.try_get("proxy_state")?;
    Ok(AttendanceRecord {
        attendance_id: AttendanceId(row.try_get("id")?),
        session_id: SessionId(row.try_get("session_id")?),
        is_proxy: row.try_get("is_proxy")?,
        proxy_state: ProxyState::parse(&raw)
            .ok_or_else(|| anyhow!("unknown proxy state '{raw}'"))?,
    })
}

fn parse_phase(raw: &str) -> Result<Phase> {
    Phase::parse(raw).ok_or_else(|| anyhow!("unknown session phase '{raw}'"))
}

fn parse_proposal_state(raw: &str) -> Result<ProposalState> {
    ProposalState::parse(raw).ok_or_else(|| anyhow!("unknown proposal state '{raw}'"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
