use thiserror::Error;

use crate::query::QueryError;

/// Failure of a single backend call.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The request never produced an HTTP response (connect, timeout, ...).
    #[error("{message}")]
    Transport { message: String },
    #[error("Request failed with status code {status}")]
    Status { status: u16, body: String },
    #[error("invalid response payload: {0}")]
    Decode(String),
    #[error(transparent)]
    InvalidQuery(#[from] QueryError),
}

impl BackendError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    /// Body of the HTTP response, when the failure was a response at all.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } if !body.is_empty() => Some(body),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return Self::Decode(value.to_string());
        }
        Self::Transport {
            message: value.to_string(),
        }
    }
}
