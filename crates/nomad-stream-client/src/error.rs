//! Client errors.

use nomad_stream_core::{Cancelled, Retryable, traits::BoxError};
use reqwest::StatusCode;
use thiserror::Error;

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response code {status}: {body}")]
    UnexpectedResponse { status: StatusCode, body: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid header {0}")]
    InvalidHeader(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    /// Status code of an unexpected response, if the server answered.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::UnexpectedResponse { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Retryable for ClientError {
    /// Only an answer with 429 or a 5xx other than 501 is worth repeating;
    /// transport and decode failures are returned as they are.
    fn is_retryable(&self) -> bool {
        self.status().is_some_and(|status| {
            status == StatusCode::TOO_MANY_REQUESTS
                || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
        })
    }
}

impl From<Cancelled> for ClientError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Terminal error delivered on an event stream channel.
#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("event stream read failed: {0}")]
    Body(#[source] BoxError),
    #[error("event stream closed by server")]
    Closed,
}
