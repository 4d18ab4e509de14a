//! Monitoring pipelines built from independent message producers.
//!
//! Provides:
//! - `multiplex` - Merge two monitor channels with error short-circuit
//! - `monitor_drain` - Wire node and allocation producers into one stream

pub mod drain;
pub mod multiplex;

pub use drain::{DrainMonitor, monitor_drain};
pub use multiplex::multiplex;
