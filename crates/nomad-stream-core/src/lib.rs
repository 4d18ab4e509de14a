//! Core abstractions for the job-scheduler client's streaming layer.
//!
//! This crate provides the fundamental building blocks:
//! - `FrameReader` - Blocking reader over a channel of byte frames
//! - `Events` / `Event` - Event stream envelopes with lazily decoded payloads
//! - `MonitorMessage` - Leveled messages produced by monitors
//! - `RetryOptions` - Backoff configuration and the retry loop
//! - Dialer and retry classification traits

pub mod encoding;
pub mod events;
pub mod frames;
pub mod monitor;
pub mod retry;
pub mod traits;

pub use events::{Event, EventError, Events, Topic};
pub use frames::{FileEvent, FrameError, FrameReader, FrameReaderError, ReadStatus, StreamFrame};
pub use monitor::{MonitorLevel, MonitorMessage};
pub use retry::{RetryOptions, retry};
pub use traits::{Cancelled, DialError, Retryable, WebSocketDialer};
