//! Wire protocol for exec sessions.
//!
//! Every WebSocket text frame carries one JSON object with at most one
//! populated section.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub height: u16,
    pub width: u16,
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "InputFrame", try_from = "InputFrame")]
pub enum ExecInput {
    /// Bytes typed into the remote process's stdin.
    Stdin(Vec<u8>),
    /// Local stdin reached end of input.
    StdinClose,
    /// The local terminal was resized.
    TtyResize(TerminalSize),
    /// Keep-alive; the empty object `{}`.
    Heartbeat,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "OutputFrame", try_from = "OutputFrame")]
pub enum ExecOutput {
    Stdout(Vec<u8>),
    StdoutClose,
    Stderr(Vec<u8>),
    StderrClose,
    /// The remote process exited with this code.
    Exited(i32),
    /// A frame with nothing to act on.
    KeepAlive,
}

/// Protocol error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame has more than one section: {0:?}")]
    MultipleSections(Vec<&'static str>),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamPayload {
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "nomad_stream_core::encoding::base64_bytes"
    )]
    data: Vec<u8>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    close: bool,
}

impl StreamPayload {
    fn data(data: Vec<u8>) -> Self {
        Self { data, close: false }
    }

    fn close() -> Self {
        Self {
            data: Vec::new(),
            close: true,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InputFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdin: Option<StreamPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tty_size: Option<TerminalSize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExitResult {
    exit_code: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OutputFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdout: Option<StreamPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stderr: Option<StreamPayload>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    exited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<ExitResult>,
}

impl From<ExecInput> for InputFrame {
    fn from(input: ExecInput) -> Self {
        match input {
            ExecInput::Stdin(data) => Self {
                stdin: Some(StreamPayload::data(data)),
                ..Self::default()
            },
            ExecInput::StdinClose => Self {
                stdin: Some(StreamPayload::close()),
                ..Self::default()
            },
            ExecInput::TtyResize(size) => Self {
                tty_size: Some(size),
                ..Self::default()
            },
            ExecInput::Heartbeat => Self::default(),
        }
    }
}

impl TryFrom<InputFrame> for ExecInput {
    type Error = ProtocolError;

    fn try_from(frame: InputFrame) -> Result<Self, Self::Error> {
        match (frame.stdin, frame.tty_size) {
            (Some(_), Some(_)) => Err(ProtocolError::MultipleSections(vec!["stdin", "tty_size"])),
            (Some(stdin), None) if stdin.close && stdin.data.is_empty() => Ok(Self::StdinClose),
            (Some(stdin), None) => Ok(Self::Stdin(stdin.data)),
            (None, Some(size)) => Ok(Self::TtyResize(size)),
            (None, None) => Ok(Self::Heartbeat),
        }
    }
}

impl From<ExecOutput> for OutputFrame {
    fn from(output: ExecOutput) -> Self {
        match output {
            ExecOutput::Stdout(data) => Self {
                stdout: Some(StreamPayload::data(data)),
                ..Self::default()
            },
            ExecOutput::StdoutClose => Self {
                stdout: Some(StreamPayload::close()),
                ..Self::default()
            },
            ExecOutput::Stderr(data) => Self {
                stderr: Some(StreamPayload::data(data)),
                ..Self::default()
            },
            ExecOutput::StderrClose => Self {
                stderr: Some(StreamPayload::close()),
                ..Self::default()
            },
            ExecOutput::Exited(exit_code) => Self {
                exited: true,
                result: Some(ExitResult { exit_code }),
                ..Self::default()
            },
            ExecOutput::KeepAlive => Self::default(),
        }
    }
}

impl TryFrom<OutputFrame> for ExecOutput {
    type Error = ProtocolError;

    /// A payload carrying data decodes as data even if `close` is also
    /// set. `exited` without a `result` carries no exit code and is
    /// treated as a keep-alive.
    fn try_from(frame: OutputFrame) -> Result<Self, Self::Error> {
        let mut sections = Vec::new();
        if frame.stdout.is_some() {
            sections.push("stdout");
        }
        if frame.stderr.is_some() {
            sections.push("stderr");
        }
        if frame.exited || frame.result.is_some() {
            sections.push("exited");
        }
        if sections.len() > 1 {
            return Err(ProtocolError::MultipleSections(sections));
        }

        let output = if let Some(stdout) = frame.stdout {
            if stdout.data.is_empty() && stdout.close {
                Self::StdoutClose
            } else {
                Self::Stdout(stdout.data)
            }
        } else if let Some(stderr) = frame.stderr {
            if stderr.data.is_empty() && stderr.close {
                Self::StderrClose
            } else {
                Self::Stderr(stderr.data)
            }
        } else {
            match (frame.exited, frame.result) {
                (true, Some(result)) => Self::Exited(result.exit_code),
                _ => Self::KeepAlive,
            }
        };
        Ok(output)
    }
}
