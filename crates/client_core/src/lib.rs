use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use shared::{
    domain::{SessionId, SessionSnapshot},
    protocol::ServerEvent,
};

pub mod error;
pub mod http;
pub mod observer;
pub mod projector;

pub use error::FeedError;
pub use http::SessionClient;
pub use observer::{spawn_observer, ObserverConfig, ObserverHandle, ObserverStatus, ObserverUpdate};
pub use projector::{Applied, SessionProjector};

pub type EventStream = BoxStream<'static, Result<ServerEvent, FeedError>>;

/// Authoritative read of a session's current state.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, FeedError>;
}

/// Push channel of change events for one session.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, session_id: SessionId) -> Result<EventStream, FeedError>;
}

/// Feed that never delivers anything. An observer built on it falls back to
/// refetching a snapshot every liveness window.
pub struct PollingOnlyFeed;

#[async_trait]
impl ChangeFeed for PollingOnlyFeed {
    async fn subscribe(&self, _session_id: SessionId) -> Result<EventStream, FeedError> {
        Ok(stream::pending().boxed())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
