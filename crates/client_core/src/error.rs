use shared::error::{ApiError, ErrorCode};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("server rejected request: {0}")]
    Api(#[from] ApiError),
    #[error("http transport failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket transport failed: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid change event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server url scheme '{0}' cannot carry a websocket")]
    UnsupportedScheme(String),
    #[error("unexpected response status {0}")]
    Status(u16),
    #[error("change feed closed")]
    Closed,
}

impl FeedError {
    /// An HTTP answer to the upgrade request is the server's verdict on the
    /// session, not a transport failure.
    pub(crate) fn from_handshake(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => Self::Status(response.status().as_u16()),
            other => Self::WebSocket(other),
        }
    }

    /// Whether reconnecting could help. Server-side rejections other than
    /// unavailability will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(err) => err.code == ErrorCode::Unavailable,
            Self::Status(status) => *status >= 500,
            Self::Decode(_) | Self::Url(_) | Self::UnsupportedScheme(_) => false,
            Self::Http(_) | Self::WebSocket(_) | Self::Closed => true,
        }
    }
}
