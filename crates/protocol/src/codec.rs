//! JSON envelope codec.
//!
//! Decoding is two-staged: the outer `{type, data}` object must parse, or the
//! connection is considered broken. A known tag carrying a payload of the
//! wrong shape, or an unknown tag, decodes to a non-fatal [`Inbound`] variant
//! so the session can log it and keep going.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::messages::Message;

/// Result of decoding one inbound wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed envelope.
    Message(Message),
    /// An envelope whose tag is not part of the protocol.
    Unknown(String),
    /// A known tag whose payload has the wrong shape.
    Invalid {
        /// The envelope tag.
        kind: String,
        /// Why the payload was rejected.
        reason: String,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Encodes an envelope as one JSON text.
pub fn encode(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes one JSON text into an envelope.
pub fn decode(text: &str) -> Result<Inbound> {
    let raw: RawEnvelope = serde_json::from_str(text)?;

    let parsed = match raw.kind.as_str() {
        "system" => payload(raw.data).map(Message::System),
        "output" => payload(raw.data).map(Message::Output),
        "input" => payload(raw.data).map(Message::Input),
        "resize" => payload(raw.data).map(Message::Resize),
        "ping" => text_or_empty(raw.data).map(Message::Ping),
        "pong" => text_or_empty(raw.data).map(Message::Pong),
        "command" => payload(raw.data).map(Message::Command),
        "error" => payload(raw.data).map(Message::Error),
        "exit" => payload(raw.data).map(Message::Exit),
        _ => return Ok(Inbound::Unknown(raw.kind)),
    };

    Ok(match parsed {
        Ok(message) => Inbound::Message(message),
        Err(e) => Inbound::Invalid {
            kind: raw.kind,
            reason: e.to_string(),
        },
    })
}

fn payload<T: DeserializeOwned>(data: Value) -> serde_json::Result<T> {
    serde_json::from_value(data)
}

/// Ping and pong payloads are free-form; clients commonly omit them.
fn text_or_empty(data: Value) -> serde_json::Result<String> {
    match data {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}
