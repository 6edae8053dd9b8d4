//! # ShellPort Protocol Library
//!
//! Envelope definitions and the JSON codec shared by the ShellPort daemon
//! and its clients.
//!
//! ## Wire Format
//!
//! Every message on the terminal WebSocket is one JSON text frame:
//!
//! ```text
//! { "type": "system" | "output" | "input" | "resize" | "ping" | "pong"
//!         | "command" | "error" | "exit",
//!   "data": <type-dependent payload> }
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode, encode, Inbound, Message};
//!
//! let text = encode(&Message::Input("ls -la\n".to_string())).unwrap();
//! assert_eq!(decode(&text).unwrap(), Inbound::Message(Message::Input("ls -la\n".into())));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Envelope and payload types
//! - [`codec`]: Encoding and tolerant decoding
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{decode, encode, Inbound};
pub use error::{ProtocolError, Result};
pub use messages::{ExitNotice, Message, Notice, Resize, CLOSED_MESSAGE, EXIT_MESSAGE};
