use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{
        AttendanceId, ProposalId, ProposalRecord, SessionId, SessionSnapshot, SessionSummary,
        VoteChoice,
    },
    error::ApiError,
    protocol::{
        CastVoteRequest, CommandOutcome, CreateProposalRequest, ProxyDecision,
        ProxyDecisionRequest, RegisterAttendanceRequest, RegisterAttendanceResponse,
        ServerEvent, SessionCommand,
    },
    view::SessionView,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::{error::FeedError, ChangeFeed, EventStream, SnapshotSource};

/// HTTP + WebSocket client for one server.
#[derive(Clone)]
pub struct SessionClient {
    http: Client,
    base: Url,
}

impl SessionClient {
    pub fn new(server_url: &str) -> Result<Self, FeedError> {
        let mut base = Url::parse(server_url.trim())?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, FeedError> {
        self.get("sessions").await
    }

    pub async fn create_session(&self) -> Result<SessionSnapshot, FeedError> {
        self.post("sessions", &()).await
    }

    pub async fn snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, FeedError> {
        self.get(&format!("sessions/{}", session_id.0)).await
    }

    pub async fn view(&self, session_id: SessionId) -> Result<SessionView, FeedError> {
        self.get(&format!("sessions/{}/view", session_id.0)).await
    }

    pub async fn apply_command(
        &self,
        session_id: SessionId,
        command: &SessionCommand,
    ) -> Result<CommandOutcome, FeedError> {
        self.post(&format!("sessions/{}/commands", session_id.0), command)
            .await
    }

    pub async fn create_proposal(
        &self,
        session_id: SessionId,
        title: &str,
        description: Option<&str>,
    ) -> Result<ProposalRecord, FeedError> {
        let body = CreateProposalRequest {
            title: title.to_string(),
            description: description.map(str::to_string),
        };
        self.post(&format!("sessions/{}/proposals", session_id.0), &body)
            .await
    }

    pub async fn register_attendance(
        &self,
        session_id: SessionId,
        is_proxy: bool,
    ) -> Result<RegisterAttendanceResponse, FeedError> {
        self.post(
            &format!("sessions/{}/attendance", session_id.0),
            &RegisterAttendanceRequest { is_proxy },
        )
        .await
    }

    pub async fn decide_proxy(
        &self,
        attendance_id: AttendanceId,
        decision: ProxyDecision,
    ) -> Result<SessionSnapshot, FeedError> {
        self.post(
            &format!("attendance/{}/proxy", attendance_id.0),
            &ProxyDecisionRequest { decision },
        )
        .await
    }

    pub async fn cast_vote(
        &self,
        proposal_id: ProposalId,
        attendance_id: AttendanceId,
        choice: VoteChoice,
    ) -> Result<SessionSnapshot, FeedError> {
        self.post(
            &format!("proposals/{}/votes", proposal_id.0),
            &CastVoteRequest {
                attendance_id,
                choice,
            },
        )
        .await
    }

    /// `ws://` (or `wss://`) address of a session's change feed.
    pub fn feed_url(&self, session_id: SessionId) -> Result<Url, FeedError> {
        let mut url = self.base.join(&format!("sessions/{}/ws", session_id.0))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|()| FeedError::UnsupportedScheme(url.scheme().to_string()))?;
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, FeedError> {
        let response = self.http.get(self.base.join(path)?).send().await?;
        decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, FeedError> {
        let response = self
            .http
            .post(self.base.join(path)?)
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, FeedError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.bytes().await?;
    match serde_json::from_slice::<ApiError>(&body) {
        Ok(err) => Err(FeedError::Api(err)),
        Err(_) => Err(FeedError::Status(status.as_u16())),
    }
}

#[async_trait]
impl SnapshotSource for SessionClient {
    async fn fetch_snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, FeedError> {
        self.snapshot(session_id).await
    }
}

#[async_trait]
impl ChangeFeed for SessionClient {
    async fn subscribe(&self, session_id: SessionId) -> Result<EventStream, FeedError> {
        let ws_url = self.feed_url(session_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(FeedError::from_handshake)?;
        debug!(session_id = session_id.0, url = %ws_url, "change feed connected");
        let (_, reader) = ws_stream.split();

        let events = reader.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => Some(Ok(event)),
                    Err(error) => {
                        warn!(%error, "skipping undecodable change event");
                        None
                    }
                },
                Ok(Message::Close(_)) => Some(Err(FeedError::Closed)),
                Ok(_) => None,
                Err(err) => Some(Err(FeedError::from(err))),
            }
        });
        Ok(events.boxed())
    }
}
