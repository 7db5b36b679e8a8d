//! Client errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure talking to the git provider or the log bucket
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never got an HTTP response
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider answered {status}: {message}")]
    Status { status: u16, message: String },

    /// A successful response whose body was not what we expected
    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl ClientError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Status { status: 404, .. })
    }

    /// GitHub rejects creating something that is already there with 422
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Status { status: 422, .. })
    }

    /// Failures that say nothing about the request itself and may clear up
    /// on their own: lost connections, rate limiting and 5xx answers
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::NotFound(_) => false,
        }
    }
}
