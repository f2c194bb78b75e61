//! Sandboxed interactive shell sessions over WebSocket.
//!
//! Each connection gets an ephemeral workspace directory and a shell running
//! on a PTY, wrapped by an isolation tool when one is available. Output is
//! sanitized for a line-oriented transport and streamed back as JSON frames.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod isolation;
pub mod launcher;
pub mod protocol;
pub mod pty;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod workspace;

pub use bridge::{BridgeEvent, EndReason, PtyBridge};
pub use config::ShellConfig;
pub use errors::{ErrorBody, ShellError, ShellResult};
pub use isolation::IsolationTool;
pub use launcher::{LaunchedShell, SandboxMode};
pub use protocol::{parse_client_message, ServerMessage};
pub use server::{build_router, serve, AppState, SessionRegistry};
pub use session::{Session, SessionState};
pub use workspace::Workspace;
