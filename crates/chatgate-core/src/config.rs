//! Configuration system for chatgate.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CHATGATE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/chatgate/config.toml
//!   3. ~/.config/chatgate/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub manager: ManagerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for every transport. HTTP and WebSocket are sniffed on
    /// the same port as raw TCP.
    pub addr: String,
    /// Outbound queue capacity per session. 0 = write synchronously.
    pub send_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for reading one message once its first byte arrived. 0 = none.
    pub read_deadline_secs: u64,
    /// Deadline for each socket write. 0 = none.
    pub write_deadline_secs: u64,
    /// Upper bound on one inbound message. 0 falls back to `wire::MAX_ENVELOPE_LEN`.
    pub max_msg_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Number of independently locked registry shards.
    pub shards: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:7100".to_string(),
            send_queue_size: 64,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_deadline_secs: 0,
            write_deadline_secs: 10,
            max_msg_size: 1_048_576, // 1 MiB
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { shards: 32 }
    }
}

impl SessionConfig {
    pub fn read_deadline(&self) -> Option<Duration> {
        secs(self.read_deadline_secs)
    }

    pub fn write_deadline(&self) -> Option<Duration> {
        secs(self.write_deadline_secs)
    }
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("chatgate")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit file, then apply env overrides. A missing file
    /// yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::from_toml(path, &text)?
        } else {
            GatewayConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_toml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CHATGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&GatewayConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply CHATGATE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CHATGATE_SERVER__ADDR") {
            self.server.addr = v;
        }
        if let Some(n) = var("CHATGATE_SERVER__SEND_QUEUE_SIZE").and_then(|v| v.parse().ok()) {
            self.server.send_queue_size = n;
        }
        if let Some(n) = var("CHATGATE_SESSION__READ_DEADLINE_SECS").and_then(|v| v.parse().ok()) {
            self.session.read_deadline_secs = n;
        }
        if let Some(n) = var("CHATGATE_SESSION__WRITE_DEADLINE_SECS").and_then(|v| v.parse().ok())
        {
            self.session.write_deadline_secs = n;
        }
        if let Some(n) = var("CHATGATE_SESSION__MAX_MSG_SIZE").and_then(|v| v.parse().ok()) {
            self.session.max_msg_size = n;
        }
        if let Some(n) = var("CHATGATE_MANAGER__SHARDS").and_then(|v| v.parse().ok()) {
            self.manager.shards = n;
        }
    }
}
