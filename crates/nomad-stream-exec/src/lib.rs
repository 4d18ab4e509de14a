//! Interactive command execution inside allocations.
//!
//! Provides:
//! - `ExecSession` - Relays stdin, resizes and heartbeats; collects output and the exit code
//! - `dial_exec` - Owning-node lookup and direct connection with fallback through the servers
//! - `ExecInput` / `ExecOutput` - WebSocket frame protocol

pub mod connect;
pub mod error;
pub mod protocol;
pub mod session;

pub use connect::{
    ExecRequest, ExecSocket, TungsteniteDialer, connect_with_fallback, dial_exec, direct_url,
    exec_url, resolve_node_address,
};
pub use error::{ExecError, SESSION_FAILED_EXIT_CODE};
pub use protocol::{ExecInput, ExecOutput, ProtocolError, TerminalSize};
pub use session::{ExecIo, ExecOptions, ExecSession, SessionState};
