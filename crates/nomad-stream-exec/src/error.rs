//! Exec session errors.

use std::io;

use nomad_stream_client::ClientError;
use nomad_stream_core::DialError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Exit code reported for any session that did not end with the remote
/// process exiting.
pub const SESSION_FAILED_EXIT_CODE: i32 = -2;

/// Exec session error.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to build exec request: {0}")]
    Request(#[from] ClientError),
    #[error("failed to connect: {0}")]
    Connect(#[from] DialError),
    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),
    #[error("websocket closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },
    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
    #[error("failed to send input: {0}")]
    Input(#[source] io::Error),
    #[error("websocket closed before receiving exit code")]
    ClosedBeforeExit,
    #[error("exec session cancelled")]
    Cancelled,
}

impl ExecError {
    /// Exit code to report for this failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        SESSION_FAILED_EXIT_CODE
    }
}

impl From<tungstenite::Error> for ExecError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
            ) => Self::ClosedBeforeExit,
            other => Self::WebSocket(Box::new(other)),
        }
    }
}
