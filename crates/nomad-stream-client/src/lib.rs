//! HTTP client for the job scheduler's streaming endpoints.
//!
//! Provides:
//! - `Client` - Query/write request executor with retried writes
//! - `EventStream` - Decoded, heartbeat-filtered event subscription
//! - `FileSystem` - Log and file frame streams feeding a `FrameReader`
//! - `Config` - Address, credentials and retry settings

pub mod client;
pub mod config;
pub mod error;
pub mod event_stream;
pub mod fs;
mod ndjson;
pub mod request;

pub use client::Client;
pub use config::Config;
pub use error::{ClientError, EventStreamError};
pub use event_stream::EventStream;
pub use fs::{FileSystem, FrameStream, LogType, LogsRequest, Origin};
pub use request::{QueryMeta, QueryOptions, WriteMeta, WriteOptions};
