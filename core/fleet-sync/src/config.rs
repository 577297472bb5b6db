//! Runtime configuration for the sync core.
//!
//! Loaded from TOML. Resolution order for the file:
//! 1. an explicit path (the CLI's `--config`)
//! 2. `FLEET_SYNC_CONFIG`
//! 3. `~/.fleet-sync/config.toml`
//!
//! A missing file yields defaults; a malformed one is an error.

use crate::binding::BindingOptions;
use crate::error::{FleetSyncError, Result};
use crate::paths::PathLayout;
use crate::presence::PresenceClassifier;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const CONFIG_ENV_VAR: &str = "FLEET_SYNC_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    pub grace_delay_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            grace_delay_ms: 100,
            read_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Detail-mode cap on concurrent one-shot reads; 0 means unbounded.
    pub max_concurrent_fetches: usize,
    pub low_battery_threshold: u8,
    pub presence_tick_ms: u64,
    pub message_limit: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 5,
            low_battery_threshold: 20,
            presence_tick_ms: 30_000,
            message_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub layout: PathLayout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub presence: PresenceClassifier,
    pub binding: BindingConfig,
    pub retry: RetryPolicy,
    pub fleet: FleetConfig,
    pub paths: PathsConfig,
}

impl SyncConfig {
    pub fn binding_options(&self) -> BindingOptions {
        BindingOptions {
            retry: self.retry.clone(),
            grace_delay: Duration::from_millis(self.binding.grace_delay_ms),
            read_timeout: Duration::from_millis(self.binding.read_timeout_ms),
            ..BindingOptions::default()
        }
    }

    /// Shared semaphore for detail fetches, `None` when unbounded.
    pub fn fetch_limiter(&self) -> Option<Arc<Semaphore>> {
        match self.fleet.max_concurrent_fetches {
            0 => None,
            permits => Some(Arc::new(Semaphore::new(permits))),
        }
    }

    pub fn presence_tick(&self) -> Duration {
        Duration::from_millis(self.fleet.presence_tick_ms.max(1))
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let problem = if self.presence.window_millis <= 0 {
            Some("presence.liveness_window_ms must be positive")
        } else if self.presence.skew_tolerance_millis < 0 {
            Some("presence.clock_skew_tolerance_ms must not be negative")
        } else if self.binding.read_timeout_ms == 0 {
            Some("binding.read_timeout_ms must be positive")
        } else if self.fleet.low_battery_threshold > 100 {
            Some("fleet.low_battery_threshold must be at most 100")
        } else {
            None
        };

        match problem {
            Some(details) => Err(FleetSyncError::ConfigMalformed {
                path: path.to_path_buf(),
                details: details.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Returns `~/.fleet-sync`.
pub fn config_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".fleet-sync"))
        .ok_or(FleetSyncError::HomeDirNotFound)
}

/// Explicit path, else `FLEET_SYNC_CONFIG`, else the default location.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("config.toml"))
}

pub fn load_config(explicit: Option<PathBuf>) -> Result<SyncConfig> {
    let path = resolve_config_path(explicit)?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        return Ok(SyncConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| FleetSyncError::Io {
        context: format!("reading config {}", path.display()),
        source,
    })?;
    let config: SyncConfig =
        toml::from_str(&content).map_err(|err| FleetSyncError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
    config.validate(path)?;
    Ok(config)
}
