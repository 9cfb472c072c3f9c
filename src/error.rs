use thiserror::Error;

/// Errors surfaced by the session client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Creating a component (or the session around it) failed.
    #[error("failed to start environment: {0}")]
    StartFailure(#[source] Box<ClientError>),

    /// The component was never started or has been stopped.
    #[error("environment was not started properly")]
    NotStarted,

    /// The component identity has been torn down.
    #[error("component has been released")]
    Released,

    /// None of the known display connectors were offered.
    #[error("unsupported connector type: {0}")]
    UnsupportedConnector(String),

    #[error("no sessions available")]
    NoSessionsAvailable,

    #[error("no active view possible")]
    NoActiveViewPossible,

    #[error("no network session available")]
    NoNetworkSession,

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    /// The backend answered with a non-success status.
    #[error("{method} {url} failed with status {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("viewer failed: {0}")]
    Viewer(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

impl ClientError {
    pub fn start_failure(cause: ClientError) -> Self {
        match cause {
            // avoid "failed to start: failed to start: ..."
            ClientError::StartFailure(_) => cause,
            other => ClientError::StartFailure(Box::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
