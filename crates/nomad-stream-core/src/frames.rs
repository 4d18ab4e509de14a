//! Byte frames of named streams and the reader that stitches them together.

use std::{fmt, sync::Arc, time::Duration};

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::traits::BoxError;

/// Event attached to a frame when the underlying file changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// The file being streamed was deleted.
    Deleted,
    /// The file being streamed was truncated.
    Truncated,
    /// Any other event reported by the server.
    Other(String),
}

impl FileEvent {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Deleted => "file deleted",
            Self::Truncated => "file truncated",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for FileEvent {
    fn from(s: String) -> Self {
        match s.as_str() {
            "file deleted" => Self::Deleted,
            "file truncated" => Self::Truncated,
            _ => Self::Other(s),
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FileEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FileEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// One chunk of a named byte stream (a log or a file being followed).
///
/// `offset` is informational: the position in the file the chunk ends at
/// according to the server. Frames are never reordered by it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default, alias = "File", skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(
        default,
        alias = "FileEvent",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_file_event"
    )]
    pub file_event: Option<FileEvent>,
    #[serde(default, alias = "Offset")]
    pub offset: i64,
    #[serde(default, alias = "Data", with = "crate::encoding::base64_bytes")]
    pub data: Vec<u8>,
}

fn empty_file_event<'de, D: Deserializer<'de>>(d: D) -> Result<Option<FileEvent>, D::Error> {
    Ok(Option::<String>::deserialize(d)?
        .filter(|s| !s.is_empty())
        .map(FileEvent::from))
}

impl StreamFrame {
    /// Create a data frame.
    #[must_use]
    pub fn new(file: impl Into<String>, offset: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            file: file.into(),
            file_event: None,
            offset,
            data: data.into(),
        }
    }

    /// An empty frame sent by the server only to keep the connection alive.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.offset == 0 && self.data.is_empty() && self.file.is_empty() && self.file_event.is_none()
    }
}

/// Error reported by a frame producer.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame stream transport error: {0}")]
    Transport(#[source] BoxError),
}

/// Frame reader error.
#[derive(Debug, Clone, Error)]
pub enum FrameReaderError {
    /// The producer reported an error; every later read returns it again.
    #[error("frame stream failed: {0}")]
    Stream(#[source] Arc<FrameError>),
}

/// Outcome of a single [`FrameReader::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were copied into the caller's buffer.
    Read(usize),
    /// The unblock timer fired before any data arrived.
    Idle,
    /// The frame channel is closed and drained, or the reader was closed.
    Eof,
}

/// Reader over a channel of [`StreamFrame`]s.
///
/// Frames are concatenated in arrival order. Callers that need exact
/// positions track [`FrameReader::offset`] after each read.
pub struct FrameReader {
    frames: mpsc::Receiver<StreamFrame>,
    errors: mpsc::Receiver<FrameError>,
    cancel: CancellationToken,
    pending: BytesMut,
    offset: u64,
    unblock_time: Duration,
    frames_closed: bool,
    errors_closed: bool,
    failure: Option<Arc<FrameError>>,
}

impl FrameReader {
    /// Create a reader.
    ///
    /// The reader takes ownership of `cancel`: [`FrameReader::close`] (or
    /// dropping the reader) cancels it to stop the producer.
    #[must_use]
    pub fn new(
        frames: mpsc::Receiver<StreamFrame>,
        errors: mpsc::Receiver<FrameError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frames,
            errors,
            cancel,
            pending: BytesMut::new(),
            offset: 0,
            unblock_time: Duration::ZERO,
            frames_closed: false,
            errors_closed: false,
            failure: None,
        }
    }

    /// Make `read` return [`ReadStatus::Idle`] after `d` without data.
    ///
    /// `Duration::ZERO` disables the timer and reads block until data,
    /// an error, or end of stream.
    pub fn set_unblock_time(&mut self, d: Duration) {
        self.unblock_time = d;
    }

    /// Total bytes handed to the caller so far.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Stop the producer. Safe to call any number of times.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Read buffered bytes into `buf`, waiting for the next frame if needed.
    ///
    /// # Errors
    /// Returns the producer's error once one has been received.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, FrameReaderError> {
        if let Some(err) = &self.failure {
            return Err(FrameReaderError::Stream(Arc::clone(err)));
        }
        if buf.is_empty() {
            return Ok(ReadStatus::Read(0));
        }

        let deadline = (!self.unblock_time.is_zero()).then(|| Instant::now() + self.unblock_time);

        while self.pending.is_empty() {
            if self.cancel.is_cancelled() {
                return Ok(ReadStatus::Eof);
            }
            if self.frames_closed {
                // The producer may have failed right before hanging up.
                if let Ok(err) = self.errors.try_recv() {
                    return Err(self.fail(err));
                }
                return Ok(ReadStatus::Eof);
            }

            let unblock = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(ReadStatus::Eof),
                frame = self.frames.recv() => match frame {
                    Some(frame) => self.pending.extend_from_slice(&frame.data),
                    None => self.frames_closed = true,
                },
                err = self.errors.recv(), if !self.errors_closed => match err {
                    Some(err) => return Err(self.fail(err)),
                    None => self.errors_closed = true,
                },
                () = unblock => return Ok(ReadStatus::Idle),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.offset += n as u64;
        Ok(ReadStatus::Read(n))
    }

    /// Read until end of stream, appending to `out`.
    ///
    /// Idle wake-ups are skipped.
    ///
    /// # Errors
    /// Returns the producer's error once one has been received.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, FrameReaderError> {
        let mut buf = [0u8; 4096];
        let start = out.len();
        loop {
            match self.read(&mut buf).await? {
                ReadStatus::Read(n) => out.extend_from_slice(&buf[..n]),
                ReadStatus::Idle => {}
                ReadStatus::Eof => return Ok(out.len() - start),
            }
        }
    }

    fn fail(&mut self, err: FrameError) -> FrameReaderError {
        let err = Arc::new(err);
        self.failure = Some(Arc::clone(&err));
        FrameReaderError::Stream(err)
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(
        capacity: usize,
    ) -> (
        mpsc::Sender<StreamFrame>,
        mpsc::Sender<FrameError>,
        CancellationToken,
        FrameReader,
    ) {
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let reader = FrameReader::new(frames_rx, errors_rx, cancel.clone());
        (frames_tx, errors_tx, cancel, reader)
    }

    #[tokio::test]
    async fn test_reads_frames_in_arrival_order() {
        let (frames_tx, _errors_tx, _cancel, mut reader) = reader(8);
        let chunks: [&[u8]; 3] = [b"hello ", b"from ", b"the stream"];
        let mut offset = 0;
        for chunk in chunks {
            offset += chunk.len() as i64;
            frames_tx
                .send(StreamFrame::new("stdout", offset, chunk))
                .await
                .unwrap();
        }
        drop(frames_tx);

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            match reader.read(&mut buf).await.unwrap() {
                ReadStatus::Read(n) => out.extend_from_slice(&buf[..n]),
                ReadStatus::Idle => panic!("unexpected idle"),
                ReadStatus::Eof => break,
            }
        }

        assert_eq!(out, b"hello from the stream");
        assert_eq!(reader.offset(), 21);
    }

    #[tokio::test]
    async fn test_arrival_order_wins_over_offsets() {
        let (frames_tx, _errors_tx, _cancel, mut reader) = reader(8);
        frames_tx.send(StreamFrame::new("f", 20, "second")).await.unwrap();
        frames_tx.send(StreamFrame::new("f", 10, "first")).await.unwrap();
        drop(frames_tx);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"secondfirst");
        assert_eq!(reader.offset(), 11);
    }

    #[tokio::test]
    async fn test_file_event_frames_carry_no_bytes() {
        let (frames_tx, _errors_tx, _cancel, mut reader) = reader(8);
        frames_tx.send(StreamFrame::new("f", 3, "abc")).await.unwrap();
        frames_tx
            .send(StreamFrame {
                file: "f".into(),
                file_event: Some(FileEvent::Truncated),
                offset: 0,
                data: Vec::new(),
            })
            .await
            .unwrap();
        frames_tx.send(StreamFrame::new("f", 2, "de")).await.unwrap();
        drop(frames_tx);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcde");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unblock_time_returns_idle() {
        let (_frames_tx, _errors_tx, _cancel, mut reader) = reader(1);
        reader.set_unblock_time(Duration::from_millis(50));

        let start = Instant::now();
        let mut buf = [0u8; 8];
        let status = reader.read(&mut buf).await.unwrap();

        assert_eq!(status, ReadStatus::Idle);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_zero_unblock_time_blocks() {
        let (_frames_tx, _errors_tx, _cancel, mut reader) = reader(1);
        reader.set_unblock_time(Duration::ZERO);

        let mut buf = [0u8; 8];
        let result =
            tokio::time::timeout(Duration::from_millis(200), reader.read(&mut buf)).await;
        assert!(result.is_err(), "read returned without data");
    }

    #[tokio::test]
    async fn test_read_pending_until_frame_arrives() {
        let (frames_tx, _errors_tx, _cancel, mut reader) = reader(1);
        let mut buf = [0u8; 8];
        {
            let mut read = tokio_test::task::spawn(reader.read(&mut buf));
            tokio_test::assert_pending!(read.poll());

            frames_tx.try_send(StreamFrame::new("f", 2, "ok")).unwrap();
            assert!(read.is_woken());
            let status = tokio_test::assert_ready_ok!(read.poll());
            assert_eq!(status, ReadStatus::Read(2));
        }
        assert_eq!(&buf[..2], b"ok");
    }

    #[tokio::test]
    async fn test_error_is_sticky() {
        let (frames_tx, errors_tx, _cancel, mut reader) = reader(1);
        errors_tx
            .send(FrameError::Transport("connection reset".into()))
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        let first = reader.read(&mut buf).await.unwrap_err();
        assert!(first.to_string().contains("connection reset"));

        // Data arriving later does not mask the failure.
        frames_tx.send(StreamFrame::new("f", 1, "x")).await.unwrap();
        let second = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(second, FrameReaderError::Stream(_)));
    }

    #[tokio::test]
    async fn test_error_sent_before_hang_up_is_reported() {
        let (frames_tx, errors_tx, _cancel, mut reader) = reader(1);
        errors_tx
            .send(FrameError::Transport("boom".into()))
            .await
            .unwrap();
        drop(frames_tx);
        drop(errors_tx);

        let mut buf = [0u8; 8];
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_cancels_producer() {
        let (frames_tx, _errors_tx, cancel, mut reader) = reader(1);

        reader.close();
        reader.close();
        assert!(cancel.is_cancelled());

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), ReadStatus::Eof);
        drop(frames_tx);
    }

    #[tokio::test]
    async fn test_drop_cancels_producer() {
        let (_frames_tx, _errors_tx, cancel, reader) = reader(1);
        drop(reader);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_frame_wire_format() {
        let frame: StreamFrame = serde_json::from_str(
            r#"{"file":"alloc/logs/web.stdout.0","file_event":"","offset":5,"data":"aGVsbG8="}"#,
        )
        .unwrap();
        assert_eq!(frame.data, b"hello");
        assert_eq!(frame.offset, 5);
        assert!(frame.file_event.is_none());

        let legacy: StreamFrame =
            serde_json::from_str(r#"{"File":"a","FileEvent":"file deleted","Offset":9}"#).unwrap();
        assert_eq!(legacy.file_event, Some(FileEvent::Deleted));
        assert!(!legacy.is_heartbeat());

        let heartbeat: StreamFrame = serde_json::from_str("{}").unwrap();
        assert!(heartbeat.is_heartbeat());
    }
}
