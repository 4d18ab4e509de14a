//! Newline-delimited JSON framing over a chunked response body.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

/// Splits a byte stream into lines.
///
/// Chunks may end anywhere, including inside a line or a UTF-8 sequence.
/// Blank lines are skipped and a trailing `\r` is stripped.
pub struct LineReader<S> {
    body: S,
    buffer: BytesMut,
    done: bool,
}

impl<S, E> LineReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            buffer: BytesMut::with_capacity(8192),
            done: false,
        }
    }

    /// Next non-blank line, `None` at end of body.
    ///
    /// Bytes left in the buffer when the body ends form a final line.
    pub async fn next_line(&mut self) -> Option<Result<Bytes, E>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some(Ok(line.freeze()));
            }

            if self.done {
                let rest = self.buffer.split();
                if rest.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                return Some(Ok(rest.freeze()));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.done = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
                None => self.done = true,
            }
        }
    }
}
