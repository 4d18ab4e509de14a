//! Core traits for retry classification and connection dialing.

use async_trait::async_trait;
use thiserror::Error;

/// Boxed error used where the concrete transport error type is not known here.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Marker error for an operation abandoned because its token was cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Classifies failures that are worth another attempt.
pub trait Retryable {
    /// Whether the operation may succeed if attempted again.
    fn is_retryable(&self) -> bool;
}

/// Dial error.
#[derive(Debug, Error)]
pub enum DialError {
    /// The target could not be reached at all (refused, timed out, gateway errors).
    #[error("node unreachable: {0}")]
    Unreachable(#[source] BoxError),
    /// The target answered but refused the connection.
    #[error("connection rejected: {0}")]
    Rejected(#[source] BoxError),
    #[error("invalid connection request: {0}")]
    InvalidRequest(String),
}

impl DialError {
    /// Whether this failure is a definitive "node unreachable" classification.
    #[must_use]
    pub const fn is_node_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Trait for WebSocket dialers.
///
/// Implementations own whatever authentication headers the connection
/// needs; callers only choose the URL.
#[async_trait]
pub trait WebSocketDialer: Send + Sync {
    /// Established connection type.
    type Connection: Send + 'static;

    /// Open a connection to `url`.
    async fn dial(&self, url: &str) -> Result<Self::Connection, DialError>;
}
