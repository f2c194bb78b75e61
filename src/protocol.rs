//! WebSocket message shapes.
//!
//! Server frames always use `{"type": "output" | "error", "data": "..."}`.
//! Client frames are `{"input": "..."}` (or the older `{"command": "..."}`),
//! and anything that is not a JSON object is taken as the literal command.

use crate::errors::{ShellError, ShellResult};
use crate::launcher::SandboxMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Text of the final frame sent after teardown.
pub const SESSION_ENDED: &str = "Session ended.";

/// A frame sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    Output(String),
    Error(String),
}

impl ServerMessage {
    pub fn output(text: impl Into<String>) -> Self {
        ServerMessage::Output(text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        ServerMessage::Error(text.into())
    }

    pub fn session_ended() -> Self {
        ServerMessage::output(SESSION_ENDED)
    }

    pub fn welcome(session_id: &str, mode: SandboxMode, workspace: &Path) -> Self {
        let note = match mode {
            SandboxMode::Isolated => "isolated sandbox",
            SandboxMode::Direct => "direct shell, isolation unavailable",
        };
        ServerMessage::output(format!(
            "Connected to session {} ({}). Workspace: {}\n",
            session_id,
            note,
            workspace.display()
        ))
    }

    pub fn to_json(&self) -> String {
        // Serializing a two-variant enum of strings cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(default, alias = "command")]
    input: Option<String>,
}

/// Extract the command text of an inbound frame.
///
/// One trailing newline is stripped since the bridge appends its own.
/// Missing or empty input is a protocol error.
pub fn parse_client_message(raw: &str) -> ShellResult<String> {
    let command = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => {
            let message: ClientMessage = serde_json::from_value(value)
                .map_err(|e| ShellError::Protocol(format!("malformed message: {}", e)))?;
            message
                .input
                .ok_or_else(|| ShellError::Protocol("message has no input field".to_string()))?
        }
        _ => raw.to_string(),
    };

    let command = strip_line_ending(&command);
    if command.is_empty() {
        return Err(ShellError::Protocol("empty input".to_string()));
    }
    Ok(command.to_string())
}

fn strip_line_ending(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}
