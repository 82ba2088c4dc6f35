//! Supervised per-session observer with resync on every (re)connect.

use std::{convert::Infallible, sync::Arc, time::Duration};

use futures::StreamExt;
use shared::{clock::Clock, domain::SessionId, protocol::ServerEvent, view::SessionView};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    error::FeedError,
    projector::{Applied, SessionProjector},
    ChangeFeed, SnapshotSource,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverConfig {
    /// How often the view is recomputed from the held snapshot.
    pub tick: Duration,
    /// Silence on the feed after which a snapshot is refetched.
    pub liveness: Duration,
    pub reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            liveness: Duration::from_secs(15),
            reconnect_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl ObserverConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << doublings)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverStatus {
    Connecting,
    Live,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverUpdate {
    pub status: ObserverStatus,
    pub view: Option<SessionView>,
}

/// Owns the observer task. Dropping the handle aborts it.
pub struct ObserverHandle {
    updates: watch::Receiver<ObserverUpdate>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ObserverHandle {
    pub fn updates(&self) -> watch::Receiver<ObserverUpdate> {
        self.updates.clone()
    }

    pub fn current(&self) -> ObserverUpdate {
        self.updates.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub fn spawn_observer(
    session_id: SessionId,
    source: Arc<dyn SnapshotSource>,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    config: ObserverConfig,
) -> ObserverHandle {
    let (updates_tx, updates) = watch::channel(ObserverUpdate {
        status: ObserverStatus::Connecting,
        view: None,
    });
    let (shutdown, shutdown_rx) = watch::channel(false);
    let observer = Observer {
        session_id,
        source,
        feed,
        clock,
        config,
        projector: SessionProjector::new(session_id),
        updates: updates_tx,
        status: ObserverStatus::Connecting,
        failures: 0,
    };
    let task = tokio::spawn(observer.run(shutdown_rx));
    ObserverHandle {
        updates,
        shutdown,
        task: Some(task),
    }
}

struct Observer {
    session_id: SessionId,
    source: Arc<dyn SnapshotSource>,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    config: ObserverConfig,
    projector: SessionProjector,
    updates: watch::Sender<ObserverUpdate>,
    status: ObserverStatus,
    failures: u32,
}

impl Observer {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(session_id = self.session_id.0, "observer started");
        loop {
            let err = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                result = self.follow() => match result {
                    Ok(never) => match never {},
                    Err(err) => err,
                },
            };

            if !err.is_retryable() {
                warn!(session_id = self.session_id.0, error = %err, "observer giving up");
                self.set_status(ObserverStatus::Failed {
                    reason: err.to_string(),
                });
                return;
            }
            self.failures += 1;
            if self.failures > self.config.reconnect_attempts {
                warn!(
                    session_id = self.session_id.0,
                    attempts = self.config.reconnect_attempts,
                    error = %err,
                    "observer exhausted reconnect attempts"
                );
                self.set_status(ObserverStatus::Failed {
                    reason: err.to_string(),
                });
                return;
            }

            let delay = self.config.backoff(self.failures);
            warn!(
                session_id = self.session_id.0,
                attempt = self.failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "change feed lost; reconnecting"
            );
            self.set_status(ObserverStatus::Reconnecting {
                attempt: self.failures,
            });
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = sleep(delay) => {}
            }
        }
        self.set_status(ObserverStatus::Stopped);
        info!(session_id = self.session_id.0, "observer stopped");
    }

    /// One connection lifetime. Only returns on failure.
    async fn follow(&mut self) -> Result<Infallible, FeedError> {
        let mut events = self.feed.subscribe(self.session_id).await?;
        let snapshot = self.source.fetch_snapshot(self.session_id).await?;
        self.projector.resync(snapshot);
        self.failures = 0;
        self.set_status(ObserverStatus::Live);
        debug!(
            session_id = self.session_id.0,
            version = self.projector.version(),
            "observer resynced"
        );

        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                item = events.next() => match item {
                    Some(Ok(ServerEvent::SessionChanged { snapshot })) => {
                        last_heard = Instant::now();
                        let version = snapshot.version();
                        match self.projector.apply(snapshot) {
                            Applied::Accepted => self.publish(),
                            Applied::Stale => debug!(
                                session_id = self.session_id.0,
                                version,
                                "discarding stale snapshot"
                            ),
                            Applied::ForeignSession => {}
                        }
                    }
                    Some(Ok(ServerEvent::Error(err))) => {
                        last_heard = Instant::now();
                        warn!(
                            session_id = self.session_id.0,
                            error = %err,
                            "server reported feed error"
                        );
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Err(FeedError::Closed),
                },
                _ = ticker.tick() => {
                    if last_heard.elapsed() >= self.config.liveness {
                        debug!(session_id = self.session_id.0, "feed quiet; refetching snapshot");
                        let snapshot = self.source.fetch_snapshot(self.session_id).await?;
                        self.projector.apply(snapshot);
                        last_heard = Instant::now();
                    }
                    self.publish();
                }
            }
        }
    }

    fn set_status(&mut self, status: ObserverStatus) {
        self.status = status;
        self.publish();
    }

    fn publish(&self) {
        self.updates.send_replace(ObserverUpdate {
            status: self.status.clone(),
            view: self.projector.view(self.clock.now()),
        });
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = ObserverConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_secs(1));
        assert_eq!(config.backoff(4), Duration::from_secs(4));
        assert_eq!(config.backoff(5), Duration::from_secs(8));
        assert_eq!(config.backoff(30), Duration::from_secs(8));
    }
}
