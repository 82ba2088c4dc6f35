use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use server_api::{ApiContext, ChangeNotifier};
use shared::{
    clock::SystemClock,
    domain::{AttendanceId, ProposalId, SessionId, VoteChoice},
    protocol::{ProxyDecision, SessionCommand},
    view::{format_clock, project},
};
use storage::Storage;

/// Writes made here go straight to the store. Connected observers pick them up
/// on their next liveness refetch.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/sessions.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateSession,
    ListSessions,
    Show {
        session_id: i64,
    },
    AddProposal {
        session_id: i64,
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
    Register {
        session_id: i64,
        #[arg(long)]
        proxy: bool,
    },
    DecideProxy {
        attendance_id: i64,
        decision: Decision,
    },
    Vote {
        proposal_id: i64,
        attendance_id: i64,
        choice: Choice,
    },
    StartDebate {
        session_id: i64,
    },
    ReturnToWaiting {
        session_id: i64,
    },
    OpenProposal {
        session_id: i64,
        proposal_id: i64,
    },
    CloseVoting {
        session_id: i64,
    },
    StartTimer {
        session_id: i64,
        duration_seconds: i64,
    },
    PauseTimer {
        session_id: i64,
    },
    ResumeTimer {
        session_id: i64,
    },
    StopTimer {
        session_id: i64,
    },
    CloseEntry {
        session_id: i64,
    },
    EntryDeadline {
        session_id: i64,
        /// RFC 3339 instant, e.g. 2026-03-14T19:30:00Z
        close_at: DateTime<Utc>,
    },
    CloseSession {
        session_id: i64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Decision {
    Approve,
    Reject,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Choice {
    Yes,
    No,
}

impl From<Decision> for ProxyDecision {
    fn from(value: Decision) -> Self {
        match value {
            Decision::Approve => Self::Approve,
            Decision::Reject => Self::Reject,
        }
    }
}

impl From<Choice> for VoteChoice {
    fn from(value: Choice) -> Self {
        match value {
            Choice::Yes => Self::Yes,
            Choice::No => Self::No,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let ctx = ApiContext::new(storage, Arc::new(SystemClock), ChangeNotifier::new(1));

    let session_command = match cli.command {
        Command::CreateSession => {
            let snapshot = server_api::create_session(&ctx).await?;
            println!("created session_id={}", snapshot.session_id().0);
            return Ok(());
        }
        Command::ListSessions => {
            for summary in server_api::list_sessions(&ctx).await? {
                println!(
                    "session_id={} phase={} version={}",
                    summary.session_id.0,
                    summary.phase.as_str(),
                    summary.version
                );
            }
            return Ok(());
        }
        Command::Show { session_id } => {
            let snapshot = server_api::load_snapshot(&ctx, SessionId(session_id)).await?;
            let view = project(&snapshot, Utc::now());
            println!(
                "session_id={} version={} phase={} timer={:?} remaining={} attendees={} pending_proxies={}",
                view.session_id.0,
                view.version,
                view.phase.as_str(),
                view.timer_state,
                format_clock(view.remaining_seconds),
                view.quorum.total_attendees,
                view.quorum.pending_proxies,
            );
            for proposal in &snapshot.proposals {
                println!(
                    "  proposal_id={} order={} state={} title={:?} yes={} no={} total={}",
                    proposal.proposal_id.0,
                    proposal.order,
                    proposal.state.as_str(),
                    proposal.title,
                    proposal.tally.yes,
                    proposal.tally.no,
                    proposal.tally.total,
                );
            }
            return Ok(());
        }
        Command::AddProposal {
            session_id,
            title,
            description,
        } => {
            let (proposal, _) = server_api::create_proposal(
                &ctx,
                SessionId(session_id),
                &title,
                description.as_deref(),
            )
            .await?;
            println!(
                "created proposal_id={} order={}",
                proposal.proposal_id.0, proposal.order
            );
            return Ok(());
        }
        Command::Register { session_id, proxy } => {
            let (attendance, _) =
                server_api::register_attendance(&ctx, SessionId(session_id), proxy).await?;
            println!(
                "registered attendance_id={} proxy={}",
                attendance.attendance_id.0,
                attendance.proxy_state.as_str()
            );
            return Ok(());
        }
        Command::DecideProxy {
            attendance_id,
            decision,
        } => {
            let snapshot =
                server_api::decide_proxy(&ctx, AttendanceId(attendance_id), decision.into())
                    .await?;
            println!("proxy decided; session version={}", snapshot.version());
            return Ok(());
        }
        Command::Vote {
            proposal_id,
            attendance_id,
            choice,
        } => {
            let snapshot = server_api::cast_vote(
                &ctx,
                ProposalId(proposal_id),
                AttendanceId(attendance_id),
                choice.into(),
            )
            .await?;
            println!("vote recorded; session version={}", snapshot.version());
            return Ok(());
        }
        Command::StartDebate { session_id } => (session_id, SessionCommand::StartDebate),
        Command::ReturnToWaiting { session_id } => (session_id, SessionCommand::ReturnToWaiting),
        Command::OpenProposal {
            session_id,
            proposal_id,
        } => (
            session_id,
            SessionCommand::OpenProposal {
                proposal_id: ProposalId(proposal_id),
            },
        ),
        Command::CloseVoting { session_id } => (session_id, SessionCommand::CloseVoting),
        Command::StartTimer {
            session_id,
            duration_seconds,
        } => (session_id, SessionCommand::StartTimer { duration_seconds }),
        Command::PauseTimer { session_id } => (session_id, SessionCommand::PauseTimer),
        Command::ResumeTimer { session_id } => (session_id, SessionCommand::ResumeTimer),
        Command::StopTimer { session_id } => (session_id, SessionCommand::StopTimer),
        Command::CloseEntry { session_id } => (session_id, SessionCommand::CloseEntry),
        Command::EntryDeadline {
            session_id,
            close_at,
        } => (session_id, SessionCommand::SetEntryDeadline { close_at }),
        Command::CloseSession { session_id } => (session_id, SessionCommand::CloseSession),
    };

    let (session_id, command) = session_command;
    let name = command.name();
    let outcome =
        server_api::apply_command_with_retry(&ctx, SessionId(session_id), command)
            .await
            .map_err(|err| anyhow!("{name} failed: {err}"))?;
    if outcome.changed {
        println!(
            "{name}: session_id={session_id} version={} phase={}",
            outcome.snapshot.version(),
            outcome.snapshot.session.phase.as_str()
        );
    } else {
        println!("{name}: nothing to change (version={})", outcome.snapshot.version());
    }
    Ok(())
}
