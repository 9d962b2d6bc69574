use thiserror::Error;

/// Failures raised by the collaborators behind the portal core.
///
/// Not-found is never an error here; lookups return `Option` instead.
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Profile store failure: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Subscription failure: {0}")]
    Subscription(String),

    #[error("Local store failure: {0}")]
    LocalStore(#[from] rusqlite::Error),

    #[error("Malformed local data: {0}")]
    MalformedLocalData(#[from] serde_json::Error),
}

impl From<reqwest::Error> for PortalError {
    fn from(e: reqwest::Error) -> Self {
        PortalError::Transport(e.to_string())
    }
}
