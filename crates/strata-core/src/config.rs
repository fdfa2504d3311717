//! Configuration system for Strata.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $STRATA_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/strata/config.toml
//!   3. ~/.config/strata/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub coordinator: CoordinatorSettings,
    pub node: NodeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// TCP address nodes connect to.
    pub listen_addr: String,
    /// Port for the local HTTP API (bound on 127.0.0.1).
    pub api_port: u16,
    /// How long `coordinate` waits for all results before giving up.
    pub job_timeout_ms: u64,
    /// How long a new connection has to send its IDENTITY frame.
    pub handshake_timeout_ms: u64,
    /// Longest a single TASK write may block before the node's link is
    /// treated as dead.
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Coordinator `host:port`.
    pub coordinator_addr: String,
    /// Stable identity announced in the IDENTITY frame.
    pub node_id: String,
    /// Max concurrent tasks. 0 = available parallelism.
    pub max_concurrent_tasks: u32,
    /// Row transform applied to every task.
    pub transform: TransformKind,
    /// Multiplier used by `TransformKind::Scale`.
    pub scale_factor: i32,
}

/// Built-in row transforms a daemon node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Return the row unchanged.
    #[default]
    Identity,
    /// Multiply every value by `scale_factor`.
    Scale,
}

impl std::str::FromStr for TransformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "scale" => Ok(Self::Scale),
            other => Err(format!("unknown transform {other:?}")),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7070".to_string(),
            api_port: 7071,
            job_timeout_ms: 30_000,
            handshake_timeout_ms: 5_000,
            send_timeout_ms: 2_000,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            coordinator_addr: "127.0.0.1:7070".to_string(),
            node_id: format!("node-{}", std::process::id()),
            max_concurrent_tasks: 0,
            transform: TransformKind::Identity,
            scale_factor: 1,
        }
    }
}

impl CoordinatorSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl NodeSettings {
    /// Worker pool size, resolving 0 to the machine's parallelism.
    pub fn worker_count(&self) -> usize {
        if self.max_concurrent_tasks == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.max_concurrent_tasks as usize
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("strata")
}

fn home_dir() -> PathBuf {
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

impl StrataConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            StrataConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file without consulting the environment.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("STRATA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StrataConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply STRATA_* overrides. `lookup` is `std::env::var` in production.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("STRATA_COORDINATOR__LISTEN_ADDR") {
            self.coordinator.listen_addr = v;
        }
        if let Some(p) = lookup("STRATA_COORDINATOR__API_PORT").and_then(|v| v.parse().ok()) {
            self.coordinator.api_port = p;
        }
        if let Some(ms) = lookup("STRATA_COORDINATOR__JOB_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.coordinator.job_timeout_ms = ms;
        }
        if let Some(ms) = lookup("STRATA_COORDINATOR__SEND_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            self.coordinator.send_timeout_ms = ms;
        }
        if let Some(v) = lookup("STRATA_NODE__COORDINATOR_ADDR") {
            self.node.coordinator_addr = v;
        }
        if let Some(v) = lookup("STRATA_NODE__NODE_ID") {
            self.node.node_id = v;
        }
        if let Some(n) = lookup("STRATA_NODE__MAX_CONCURRENT_TASKS").and_then(|v| v.parse().ok()) {
            self.node.max_concurrent_tasks = n;
        }
        if let Some(t) = lookup("STRATA_NODE__TRANSFORM").and_then(|v| v.parse().ok()) {
            self.node.transform = t;
        }
    }
}
