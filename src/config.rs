//! Service configuration
//!
//! Loaded from the TOML file named by `SKYFLEET_CONFIG`; every section falls
//! back to its defaults when absent.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skyfleet_shared::defaults;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SKYFLEET_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub link: LinkSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

/// Link establishment and MAVLink parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Bounded wait for a new link to report itself live
    pub live_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Size of the worker pool running blocking link attempts
    pub worker_threads: usize,
    /// Bound on publish and recording calls
    pub command_timeout_ms: u64,
    /// System ID for this ground station
    pub system_id: u8,
    pub component_id: u8,
    /// Target system ID (flight controller)
    pub target_system: u8,
    pub target_component: u8,
    pub heartbeat_timeout_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            live_timeout_ms: defaults::LINK_LIVE_TIMEOUT_MS,
            poll_interval_ms: defaults::LINK_POLL_INTERVAL_MS,
            worker_threads: defaults::LINK_WORKER_THREADS,
            command_timeout_ms: defaults::LINK_COMMAND_TIMEOUT_MS,
            system_id: 255,      // Ground control station
            component_id: 190,   // MAV_COMP_ID_MISSIONPLANNER
            target_system: 1,    // Autopilot
            target_component: 1, // MAV_COMP_ID_AUTOPILOT1
            heartbeat_timeout_ms: defaults::HEARTBEAT_TIMEOUT_MS,
        }
    }
}

impl LinkSettings {
    pub fn live_timeout(&self) -> Duration {
        Duration::from_millis(self.live_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Database holding drones, connection history and the operation audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite URL, e.g. `sqlite://skyfleet.db` or `sqlite::memory:`
    pub url: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://skyfleet.db".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: defaults::CACHE_TTL_SECS,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter level when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `SKYFLEET_CONFIG` when set, otherwise use defaults
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.link.worker_threads == 0 {
            anyhow::bail!("link.worker_threads must be at least 1");
        }
        if self.link.live_timeout_ms == 0 {
            anyhow::bail!("link.live_timeout_ms must be positive");
        }
        if !self.store.url.starts_with("sqlite:") {
            anyhow::bail!("store.url must be a sqlite: URL, got {:?}", self.store.url);
        }
        Ok(())
    }
}
