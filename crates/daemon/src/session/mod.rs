//! Terminal session module.
//!
//! This module provides PTY spawning, the per-session pumps and the registry
//! of live sessions.

pub mod commands;
pub mod connection;
pub mod pty;
pub mod registry;
pub mod terminal;

pub use commands::{interpret, CommandAction};
pub use connection::{Connection, ConnectionError};
pub use pty::{detect_shell, SessionError, SessionId, SessionOptions};
pub use registry::{RegistryError, SessionDescriptor, SessionRegistry, SessionState};
pub use terminal::Session;
