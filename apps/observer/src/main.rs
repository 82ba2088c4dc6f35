use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{
    spawn_observer, ChangeFeed, ObserverConfig, ObserverStatus, ObserverUpdate, PollingOnlyFeed,
    SessionClient,
};
use shared::{
    clock::SystemClock,
    domain::SessionId,
    quorum::EntryWindow,
    view::{format_clock, SessionView},
};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    session_id: i64,
    /// Skip the WebSocket feed and refetch snapshots every liveness window.
    #[arg(long)]
    poll: bool,
    #[arg(long, default_value_t = 15)]
    liveness_seconds: u64,
    #[arg(long, default_value_t = 5)]
    reconnect_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let client = Arc::new(SessionClient::new(&args.server_url)?);
    let feed: Arc<dyn ChangeFeed> = if args.poll {
        Arc::new(PollingOnlyFeed)
    } else {
        client.clone()
    };
    let config = ObserverConfig {
        liveness: Duration::from_secs(args.liveness_seconds.max(1)),
        reconnect_attempts: args.reconnect_attempts,
        ..ObserverConfig::default()
    };
    let session_id = SessionId(args.session_id);
    info!(
        session_id = session_id.0,
        server_url = %client.base_url(),
        poll = args.poll,
        "attaching observer"
    );

    let handle = spawn_observer(session_id, client, feed, Arc::new(SystemClock), config);
    let mut updates = handle.updates();
    let mut last_line = String::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.shutdown().await;
                return Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let update = updates.borrow_and_update().clone();
                let line = render(&update);
                if line != last_line {
                    println!("{line}");
                    last_line = line;
                }
                if let ObserverStatus::Failed { reason } = update.status {
                    bail!("observer for session {} failed: {reason}", session_id.0);
                }
                if update.status == ObserverStatus::Stopped {
                    return Ok(());
                }
            }
        }
    }
}

fn render(update: &ObserverUpdate) -> String {
    let status = match &update.status {
        ObserverStatus::Connecting => "connecting".to_string(),
        ObserverStatus::Live => "live".to_string(),
        ObserverStatus::Reconnecting { attempt } => format!("reconnecting#{attempt}"),
        ObserverStatus::Failed { .. } => "failed".to_string(),
        ObserverStatus::Stopped => "stopped".to_string(),
    };
    match &update.view {
        Some(view) => format!("[{status}] {}", describe(view)),
        None => format!("[{status}] waiting for first snapshot"),
    }
}

fn describe(view: &SessionView) -> String {
    let timer = format!("{:?}", view.timer_state).to_lowercase();
    let entry = match view.entry {
        EntryWindow::Unrestricted => "entry open".to_string(),
        EntryWindow::Open { remaining_seconds } => {
            format!("entry closes in {}", format_clock(remaining_seconds))
        }
        EntryWindow::Closed => "entry closed".to_string(),
    };
    let proposal = view
        .open_proposal
        .as_ref()
        .map(|p| format!(" | voting on #{} {:?}", p.order, p.title))
        .unwrap_or_default();
    format!(
        "v{} {} | timer {} {} | attendees {} (+{} pending) | {}{}",
        view.version,
        view.phase.as_str(),
        timer,
        format_clock(view.remaining_seconds),
        view.quorum.total_attendees,
        view.quorum.pending_proxies,
        entry,
        proposal,
    )
}
