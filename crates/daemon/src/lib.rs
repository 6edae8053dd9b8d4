//! # ShellPort Daemon Library
//!
//! This crate provides the server side of ShellPort: interactive shells on
//! this host, exposed to browser clients as terminal sessions over a
//! WebSocket.
//!
//! ## Overview
//!
//! - **Terminal Sessions**: one shell per session, bound to a PTY and bridged
//!   to a single duplex connection
//! - **Session Registry**: lookup, listing, force-close and reaping of sessions
//! - **Target Inventory**: the containers a terminal may be opened against
//! - **HTTP Surface**: JSON endpoints plus the terminal WebSocket
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                   HTTP Router (axum)                      │
//! │   /api/containers   /api/terminal/sessions   /ws/...      │
//! ├───────────────┬───────────────────────────┬───────────────┤
//! │   Inventory   │     Session Registry      │    Config     │
//! ├───────────────┴───────────────────────────┴───────────────┤
//! │                        Session                            │
//! │   output pump  ◄── PTY ──►  input pump      monitor       │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::config::Config;
//! use daemon::server::{serve, AppState};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
//!
//!     let state = AppState::from_config(&config);
//!     serve(listener, state, &config.server.allowed_origins, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`inventory`]: Target descriptors and lookup
//! - [`session`]: PTY, sessions and the session registry
//! - [`server`]: HTTP routes and the terminal WebSocket handler

pub mod config;
pub mod inventory;
pub mod server;
pub mod session;

pub use config::Config;
