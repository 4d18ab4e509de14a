//! Allocation log and file streams.

use std::fmt;

use bytes::Bytes;
use futures::Stream;
use nomad_stream_core::{FrameError, FrameReader, StreamFrame};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Client, error::ClientError, ndjson::LineReader, request::QueryOptions};

const FRAME_CHANNEL_CAPACITY: usize = 10;

/// Where a stream starts reading, relative to `offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Origin {
    #[default]
    Start,
    End,
}

impl Origin {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
        }
    }
}

/// Which task log to stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogType {
    #[default]
    Stdout,
    Stderr,
}

impl LogType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a task log stream.
#[derive(Debug, Clone)]
pub struct LogsRequest {
    pub task: String,
    pub log_type: LogType,
    /// Keep the stream open and deliver new output as it is written.
    pub follow: bool,
    pub origin: Origin,
    pub offset: i64,
}

impl LogsRequest {
    /// Stream `task`'s stdout from the beginning without following.
    #[must_use]
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            log_type: LogType::Stdout,
            follow: false,
            origin: Origin::Start,
            offset: 0,
        }
    }

    #[must_use]
    pub const fn log_type(mut self, log_type: LogType) -> Self {
        self.log_type = log_type;
        self
    }

    #[must_use]
    pub const fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    /// Start `offset` bytes from `origin`.
    #[must_use]
    pub const fn from(mut self, origin: Origin, offset: i64) -> Self {
        self.origin = origin;
        self.offset = offset;
        self
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![
            ("task".to_string(), self.task.clone()),
            ("type".to_string(), self.log_type.as_str().to_string()),
            ("follow".to_string(), self.follow.to_string()),
            ("origin".to_string(), self.origin.as_str().to_string()),
            ("offset".to_string(), self.offset.to_string()),
            ("plain".to_string(), "false".to_string()),
        ]
    }
}

/// Receiving ends of a frame stream.
///
/// The producer stops when `cancel` fires or either receiver is dropped.
pub struct FrameStream {
    pub frames: mpsc::Receiver<StreamFrame>,
    pub errors: mpsc::Receiver<FrameError>,
    pub cancel: CancellationToken,
}

impl FrameStream {
    /// Turn the stream into a blocking byte reader that owns its cancellation.
    #[must_use]
    pub fn into_reader(self) -> FrameReader {
        FrameReader::new(self.frames, self.errors, self.cancel)
    }
}

/// Allocation file-system endpoints.
pub struct FileSystem<'a> {
    client: &'a Client,
}

impl Client {
    /// Allocation file-system endpoints.
    #[must_use]
    pub const fn fs(&self) -> FileSystem<'_> {
        FileSystem { client: self }
    }
}

impl FileSystem<'_> {
    /// Stream a task's logs.
    ///
    /// # Errors
    /// Returns error if the request cannot be sent or the server rejects it.
    pub async fn logs(
        &self,
        alloc_id: &str,
        request: &LogsRequest,
        cancel: CancellationToken,
        q: &QueryOptions,
    ) -> Result<FrameStream, ClientError> {
        let path = format!("/v1/client/fs/logs/{alloc_id}");
        tracing::debug!(alloc_id, task = %request.task, log_type = %request.log_type, "streaming logs");
        self.open(&path, request.params(), cancel, q).await
    }

    /// Follow a file in the allocation directory.
    ///
    /// # Errors
    /// Returns error if the request cannot be sent or the server rejects it.
    pub async fn stream(
        &self,
        alloc_id: &str,
        path: &str,
        origin: Origin,
        offset: i64,
        cancel: CancellationToken,
        q: &QueryOptions,
    ) -> Result<FrameStream, ClientError> {
        let params = vec![
            ("path".to_string(), path.to_string()),
            ("follow".to_string(), "true".to_string()),
            ("origin".to_string(), origin.as_str().to_string()),
            ("offset".to_string(), offset.to_string()),
        ];
        let url_path = format!("/v1/client/fs/stream/{alloc_id}");
        self.open(&url_path, params, cancel, q).await
    }

    async fn open(
        &self,
        path: &str,
        params: Vec<(String, String)>,
        cancel: CancellationToken,
        q: &QueryOptions,
    ) -> Result<FrameStream, ClientError> {
        let response = self.client.stream_get(path, q, params).await?;

        let (frames_tx, frames) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (errors_tx, errors) = mpsc::channel(1);
        tokio::spawn(decode_frames(
            Box::pin(response.bytes_stream()),
            cancel.clone(),
            frames_tx,
            errors_tx,
        ));
        Ok(FrameStream {
            frames,
            errors,
            cancel,
        })
    }
}

/// Decode frames from `body`, dropping heartbeats.
///
/// Body end closes `frames`; a failure is sent on `errors` first.
pub(crate) async fn decode_frames<S, E>(
    body: S,
    cancel: CancellationToken,
    frames: mpsc::Sender<StreamFrame>,
    errors: mpsc::Sender<FrameError>,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut lines = LineReader::new(body);
    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        let frame = match line {
            None => return,
            Some(Err(e)) => {
                let _ = errors.try_send(FrameError::Transport(Box::new(e)));
                return;
            }
            Some(Ok(line)) => match serde_json::from_slice::<StreamFrame>(&line) {
                Ok(frame) if frame.is_heartbeat() => continue,
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable stream frame");
                    let _ = errors.try_send(FrameError::Decode(e));
                    return;
                }
            },
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            sent = frames.send(frame) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
