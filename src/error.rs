use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("User is not a participant of conversation {0}")]
    Authorization(Uuid),
    #[error("Store operation failed: {0}")]
    TransientStore(String),
    #[error("Invalid attachment: {0}")]
    Validation(String),
    #[error("Live channel dropped: {0}")]
    Channel(String),
    #[error("Malformed record from store: {0}")]
    Decode(String),
    #[error("Conversation already exists for this pair")]
    Conflict,
    #[error("Not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl AppError {
    /// Whether a manual retry of the failed operation can succeed.
    /// Authorization and validation failures are final; store and channel
    /// hiccups are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Channel(_))
    }
}
