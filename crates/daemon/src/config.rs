//! Configuration management for the ShellPort daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellport/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inventory::{sample_targets, Target};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("bind must be a socket address like 127.0.0.1:8080, got {0}")]
    InvalidBindAddress(String),

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("kill_grace_ms must be between 0 and 60000, got {0}")]
    InvalidKillGrace(u64),

    #[error("reap_interval_secs must be greater than 0")]
    InvalidReapInterval,

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("duplicate target id in inventory: {0}")]
    DuplicateTarget(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ShellPort daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener and logging configuration.
    pub server: ServerConfig,

    /// Terminal session configuration.
    pub session: SessionConfig,

    /// Targets that terminals may be opened against.
    pub inventory: InventoryConfig,
}

/// HTTP listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind: String,

    /// Origins allowed by CORS. Empty means any origin.
    pub allowed_origins: Vec<String>,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily-rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Terminal session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to spawn. Detected per platform when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Milliseconds between SIGTERM and SIGKILL when a session closes.
    pub kill_grace_ms: u64,

    /// Seconds between background sweeps for dead sessions.
    pub reap_interval_secs: u64,
}

/// Static target inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InventoryConfig {
    /// Known targets.
    pub targets: Vec<Target>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            max_sessions: 10,
            cols: 80,
            rows: 24,
            kill_grace_ms: 2000,
            reap_interval_secs: 60,
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            targets: sample_targets(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellport")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLPORT_BIND: Override the listen address
    /// - SHELLPORT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("SHELLPORT_BIND") {
            if !bind.is_empty() {
                tracing::info!("Overriding bind from environment: {}", bind);
                self.server.bind = bind;
            }
        }

        if let Ok(level) = std::env::var("SHELLPORT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(self.server.bind.clone()));
        }

        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.session.kill_grace_ms > 60_000 {
            return Err(ConfigError::InvalidKillGrace(self.session.kill_grace_ms));
        }

        if self.session.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidReapInterval);
        }

        if let Some(shell) = self.session.shell.as_deref().filter(|s| !s.is_empty()) {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.to_string()));
            }
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.inventory.targets {
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.id.clone()));
            }
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::TargetStatus;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.server.allowed_origins, vec!["http://localhost:3000"]);
        assert!(config.server.log_file.is_none());
        assert!(config.session.shell.is_none());
        assert_eq!(config.session.max_sessions, 10);
        assert_eq!((config.session.cols, config.session.rows), (80, 24));
        assert_eq!(config.session.kill_grace_ms, 2000);
        assert_eq!(config.inventory.targets.len(), 3);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
log_level = "debug"

[session]
max_sessions = 5
shell = "/bin/sh"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.session.shell.as_deref(), Some("/bin/sh"));
        assert_eq!(config.session.cols, 80);
    }

    #[test]
    fn test_from_toml_targets_replace_samples() {
        let toml = r#"
[[inventory.targets]]
id = "build-01"
name = "build-runner"
status = "online"
node_addr = "10.0.0.5:3022"

[inventory.targets.labels]
role = "ci"

[[inventory.targets]]
id = "build-02"
name = "build-runner-2"
status = "draining"
"#;
        let config = Config::from_toml(toml).unwrap();
        let targets = &config.inventory.targets;

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, "build-01");
        assert_eq!(targets[0].status, TargetStatus::Online);
        assert_eq!(targets[0].labels.get("role").map(String::as_str), Some("ci"));
        assert_eq!(targets[1].status, TargetStatus::Other("draining".to_string()));
        assert!(targets[1].node_addr.is_empty());
    }

    #[test]
    fn test_from_toml_invalid() {
        let result = Config::from_toml("[server\nbind = 1");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let mut config = Config::default();
        config.session.shell = Some("/bin/sh".to_string());
        config.server.log_file = Some(PathBuf::from("/var/log/shellport"));

        let toml_str = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml_str).unwrap();

        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.server.bind = "0.0.0.0:9000".to_string();
        config.session.max_sessions = 3;

        config.save(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "this is not = [valid").unwrap();

        let result = Config::load(&path);
        assert!(result.is_err());
        assert!(format!("{:#}", result.unwrap_err()).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("shellport/config.toml"));
    }

    #[test]
    fn test_validate_bind_address() {
        let mut config = Config::default();
        config.server.bind = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = Config::default();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = Config::default();
        config.session.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_kill_grace_and_reap_interval() {
        let mut config = Config::default();
        config.session.kill_grace_ms = 60_001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidKillGrace(60_001)));

        let mut config = Config::default();
        config.session.reap_interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReapInterval));
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = Config::default();
        config.session.shell = Some("/nonexistent/shell".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );

        config.session.shell = Some("definitely-not-a-shell-binary".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_in_path() {
        let mut config = Config::default();
        config.session.shell = Some("sh".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.server.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.server.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_target() {
        let mut config = Config::default();
        let first = config.inventory.targets[0].clone();
        config.inventory.targets.push(first.clone());
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateTarget(first.id))
        );
    }

    #[test]
    #[serial]
    fn test_env_override_bind() {
        std::env::set_var("SHELLPORT_BIND", "0.0.0.0:7070");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("SHELLPORT_BIND");

        assert_eq!(config.server.bind, "0.0.0.0:7070");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("SHELLPORT_LOG_LEVEL", "trace");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("SHELLPORT_LOG_LEVEL");

        assert_eq!(config.server.log_level, "trace");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_is_ignored() {
        std::env::set_var("SHELLPORT_BIND", "");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("SHELLPORT_BIND");

        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }
}
