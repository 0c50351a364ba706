use thiserror::Error;
use uuid::Uuid;

#[cfg(any(test, feature = "local"))]
use macfind_db::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("realtime connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("realtime subscription rejected: {0}")]
    Rejected(String),

    #[error("item {0} not found")]
    ItemNotFound(Uuid),

    #[error("no session for user {0}")]
    NoSession(Uuid),

    #[cfg(any(test, feature = "local"))]
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("bad payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl SyncError {
    /// The caller was not allowed to do this. The library treats these as
    /// quiet failures rather than errors.
    pub fn is_policy_denied(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 403,
            #[cfg(any(test, feature = "local"))]
            Self::Store(StoreError::PolicyDenied(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
