pub mod loader;

use crate::provider::{ProviderBinding, ProviderKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine settings. Category settings live in the settings store instead.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "ProviderKind::default_bindings")]
    pub providers: Vec<ProviderBinding>,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Quiet period after the last list mutation before re-scanning.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How often the location is checked for in-page navigation.
    #[serde(default = "default_location_poll_ms")]
    pub location_poll_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StoreConfig {
    pub path: String,
    /// How often the store file is checked for edits by other processes.
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_location_poll_ms() -> u64 {
    1000
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn location_poll(&self) -> Duration {
        Duration::from_millis(self.location_poll_ms.max(1))
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            location_poll_ms: default_location_poll_ms(),
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(1000).max(1))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "inbox-tagger-store.json".to_string(),
            poll_interval_ms: Some(1000),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            providers: ProviderKind::default_bindings(),
            watcher: WatcherConfig::default(),
            store: StoreConfig::default(),
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
        }
    }
}
