//! Terminal envelope definitions.
//!
//! Every wire message is a single JSON object of the form
//! `{"type": <tag>, "data": <payload>}`. The payload shape depends on the tag.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Message sent to the client when the shell process exits.
pub const EXIT_MESSAGE: &str = "terminal session ended";

/// Message sent to the client when the session is torn down.
pub const CLOSED_MESSAGE: &str = "terminal session closed";

/// A single envelope exchanged over the duplex connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Message {
    /// Informational notice from the server (greeting, teardown).
    System(Notice),
    /// Raw terminal output.
    Output(String),
    /// Raw terminal input, written verbatim.
    Input(String),
    /// Terminal geometry change.
    Resize(Resize),
    /// Liveness probe from the client.
    Ping(String),
    /// Reply to a ping.
    Pong(String),
    /// Command routed through the command interpreter.
    Command(String),
    /// Error notice.
    Error(Notice),
    /// Shell process exit notification.
    Exit(ExitNotice),
}

/// Payload of `system` and `error` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    /// Human-readable message.
    pub message: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Session the notice refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Payload of `resize` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
}

/// Payload of `exit` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitNotice {
    /// Human-readable message.
    pub message: String,
    /// Process exit code (0 when unavailable).
    pub code: i32,
    /// Session that exited.
    pub session_id: String,
}

impl Notice {
    /// Creates a notice stamped with the current time.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: now_rfc3339(),
            session_id: None,
        }
    }

    /// Attaches a session identifier to the notice.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl Message {
    /// Builds an `error` envelope.
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error(Notice::new(message))
    }

    /// Builds an `exit` envelope for the given session.
    pub fn exit(code: i32, session_id: impl Into<String>) -> Self {
        Message::Exit(ExitNotice {
            message: EXIT_MESSAGE.to_string(),
            code,
            session_id: session_id.into(),
        })
    }

    /// Returns the wire tag of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::System(_) => "system",
            Message::Output(_) => "output",
            Message::Input(_) => "input",
            Message::Resize(_) => "resize",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Command(_) => "command",
            Message::Error(_) => "error",
            Message::Exit(_) => "exit",
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
