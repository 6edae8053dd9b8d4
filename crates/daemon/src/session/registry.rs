//! Session registry.
//!
//! Maps session identifiers to sessions. A descriptor is registered before
//! the WebSocket upgrade and the live [`Session`] is attached once the shell
//! is running. Dead sessions are purged lazily on enumeration, eagerly on
//! explicit close, and periodically by the optional reaper task.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::pty::SessionId;
use super::terminal::Session;

/// How long a descriptor may stay unattached before it is considered stale.
pub const CONNECTING_TTL: Duration = Duration::from_secs(30);

/// Errors returned by the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session limit reached ({0} active)")]
    CapacityExceeded(usize),

    #[error("session not found: {0}")]
    NotFound(SessionId),
}

/// Lifecycle state shown in session listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Registered, shell not yet attached.
    Connecting,
    /// Shell running and bridged to a client.
    Connected,
}

/// Lightweight public view of a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: SessionId,
    #[serde(rename = "containerId")]
    pub target_id: String,
    pub status: SessionState,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    descriptor: SessionDescriptor,
    session: Option<Arc<Session>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        match &self.session {
            Some(session) => session.is_alive(),
            None => (now - self.descriptor.created_at)
                .to_std()
                .map_or(true, |age| age <= CONNECTING_TTL),
        }
    }
}

/// Registry of terminal sessions.
pub struct SessionRegistry {
    entries: DashMap<SessionId, Entry>,
    max_sessions: usize,
    /// Serializes the capacity check with the insert.
    admission: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_sessions,
            admission: Mutex::new(()),
        }
    }

    /// Registers a new descriptor for `target_id` in the connecting state.
    ///
    /// Does not spawn anything; see [`SessionRegistry::attach`].
    pub fn create_session(&self, target_id: &str) -> Result<SessionDescriptor, RegistryError> {
        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);

        if self.entries.len() >= self.max_sessions {
            return Err(RegistryError::CapacityExceeded(self.entries.len()));
        }

        let created_at = Utc::now();
        let descriptor = SessionDescriptor {
            id: session_id(target_id, created_at),
            target_id: target_id.to_string(),
            status: SessionState::Connecting,
            created_at,
        };

        self.entries.insert(
            descriptor.id.clone(),
            Entry {
                descriptor: descriptor.clone(),
                session: None,
            },
        );

        debug!(session_id = %descriptor.id, target_id, "Registered session");
        Ok(descriptor)
    }

    /// Binds a running session to its descriptor and marks it connected.
    pub fn attach(&self, id: &str, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.descriptor.status = SessionState::Connected;
        entry.session = Some(session);
        Ok(())
    }

    /// Returns the live session bound to `id`, if any.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.entries.get(id).and_then(|entry| entry.session.clone())
    }

    /// Descriptor of a live session, or one still connecting.
    pub fn descriptor(&self, id: &str) -> Option<SessionDescriptor> {
        let now = Utc::now();
        self.entries
            .get(id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.descriptor.clone())
    }

    /// Lists live sessions, oldest first, dropping dead ones on the way.
    pub fn list_active(&self) -> Vec<SessionDescriptor> {
        let now = Utc::now();
        self.entries.retain(|id, entry| {
            let live = entry.is_live(now);
            if !live {
                debug!(session_id = %id, "Reaping dead session");
            }
            live
        });

        let mut active: Vec<SessionDescriptor> = self
            .entries
            .iter()
            .map(|entry| entry.descriptor.clone())
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    /// Deletes the entry. Absent ids are fine.
    pub fn remove(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            debug!(session_id = %id, "Removed session");
        }
    }

    /// Closes and removes the session. Returns whether it was registered.
    pub async fn close_and_remove(&self, id: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };

        if let Some(session) = entry.session {
            session.close().await;
        }
        info!(session_id = %id, "Session closed by request");
        true
    }

    /// Closes and removes every session.
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.entries.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Closing all sessions");
        }

        let closes = ids.iter().map(|id| self.close_and_remove(id));
        futures::future::join_all(closes).await;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Runs the lazy purge every `interval` until `cancel` fires.
    pub fn start_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let before = registry.len();
                        let after = registry.list_active().len();
                        if after < before {
                            info!(reaped = before - after, "Reaped dead sessions");
                        }
                    }
                }
            }
        })
    }
}

/// `session-<target>-<YYYYMMDDHHMMSS>-<8 hex>`; the random suffix keeps ids
/// unique within one second.
fn session_id(target_id: &str, at: DateTime<Utc>) -> SessionId {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("session-{}-{}-{}", target_id, at.format("%Y%m%d%H%M%S"), &suffix[..8])
}
