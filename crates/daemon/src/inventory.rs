//! Target inventory.
//!
//! A target is a host or container a terminal may be opened against. The
//! daemon only consults the inventory to check that a target exists and is
//! online before a session is created.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by an inventory backend.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The backend could not be queried.
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}

/// Reachability status reported for a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TargetStatus {
    Online,
    Offline,
    /// Any other status string, preserved as reported.
    Other(String),
}

impl TargetStatus {
    /// Only online targets accept new sessions.
    pub fn is_online(&self) -> bool {
        matches!(self, TargetStatus::Online)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetStatus::Online => "online",
            TargetStatus::Offline => "offline",
            TargetStatus::Other(s) => s,
        }
    }
}

impl From<String> for TargetStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "online" => TargetStatus::Online,
            "offline" => TargetStatus::Offline,
            _ => TargetStatus::Other(s),
        }
    }
}

impl From<TargetStatus> for String {
    fn from(status: TargetStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host or container terminals can be opened against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub name: String,
    pub status: TargetStatus,
    #[serde(default, alias = "nodeAddr")]
    pub node_addr: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Source of target descriptors.
pub trait Inventory: Send + Sync {
    /// Lists every known target.
    fn list(&self) -> Result<Vec<Target>, InventoryError>;

    /// Looks up one target. `Ok(None)` means the id is unknown.
    fn get(&self, id: &str) -> Result<Option<Target>, InventoryError> {
        Ok(self.list()?.into_iter().find(|t| t.id == id))
    }
}

/// Inventory backed by a fixed list, usually from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    targets: Vec<Target>,
}

impl StaticInventory {
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }
}

impl Inventory for StaticInventory {
    fn list(&self) -> Result<Vec<Target>, InventoryError> {
        Ok(self.targets.clone())
    }

    fn get(&self, id: &str) -> Result<Option<Target>, InventoryError> {
        Ok(self.targets.iter().find(|t| t.id == id).cloned())
    }
}

/// The sample targets shipped in the default configuration.
pub fn sample_targets() -> Vec<Target> {
    let target = |id: &str, name: &str, status: TargetStatus, labels: &[(&str, &str)]| Target {
        id: id.to_string(),
        name: name.to_string(),
        status,
        node_addr: "0.0.0.0:3022".to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    };

    vec![
        target(
            "web-001",
            "web-server",
            TargetStatus::Online,
            &[("app", "web"), ("env", "production")],
        ),
        target(
            "db-001",
            "database",
            TargetStatus::Online,
            &[("app", "database"), ("env", "production")],
        ),
        target(
            "api-001",
            "api-server",
            TargetStatus::Offline,
            &[("app", "api"), ("env", "staging")],
        ),
    ]
}
