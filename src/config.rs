//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `node.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - DeviceConfig: identity file, network identity overrides, static sensors.
//!     - EngineConfig: harvest timeout and idle standby.
//!     - HotswapConfig: scan interval, per-bus timeout, address range.
//!     - FailoverConfig: durable queue location and retry interval.
//!     - LifecycleConfig: login polling and registration bounds.
//!     - LedgerConfig: where the ledger gateway lives.
//!
//! ==============================================================================

use crate::sensors::ChipSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub device: DeviceConfig,
    pub engine: EngineConfig,
    pub events: EventsConfig,
    pub hotswap: HotswapConfig,
    pub failover: FailoverConfig,
    pub lifecycle: LifecycleConfig,
    pub geo: GeoConfig,
    pub ledger: LedgerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    /// file holding the ledger-assigned device id
    pub identity_file: PathBuf,
    /// overrides the hostname reported by the system
    pub hostname: Option<String>,
    /// overrides the detected outbound ip address
    pub ip_address: Option<String>,
    /// extra sensor ids hotswap must never remove; sensors registered at
    /// startup are protected without being listed here
    pub static_sensors: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub harvest_timeout_ms: u64,
    pub standby_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EventsConfig {
    /// per-subscriber delivery buffer
    pub buffer: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HotswapConfig {
    pub interval_secs: u64,
    pub bus_timeout_ms: u64,
    pub buses: Vec<u8>,
    pub address_start: u8,
    pub address_end: u8,
    /// chips the scanner knows how to identify
    pub chips: Vec<ChipSpec>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FailoverConfig {
    pub store_path: PathBuf,
    pub retry_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub login_poll_attempts: u32,
    pub login_poll_backoff_ms: u64,
    pub registration_timeout_secs: u64,
    pub spec_discovery_attempts: u32,
    pub spec_discovery_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeoConfig {
    /// asset search radius in metres
    pub radius_m: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub url: String,
    pub request_timeout_secs: u64,
    pub event_poll_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            identity_file: PathBuf::from("data").join("device.id"),
            hostname: None,
            ip_address: None,
            static_sensors: Vec::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { harvest_timeout_ms: 2_000, standby_secs: 30 }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { buffer: 64 }
    }
}

impl Default for HotswapConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            bus_timeout_ms: 3_000,
            buses: vec![1],
            address_start: 0x03,
            address_end: 0x77,
            chips: Vec::new(),
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data").join("readings.redb"),
            retry_interval_secs: 60,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            login_poll_attempts: 5,
            login_poll_backoff_ms: 2_000,
            registration_timeout_secs: 600,
            spec_discovery_attempts: 5,
            spec_discovery_backoff_ms: 1_000,
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self { radius_m: 1_000.0 }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            request_timeout_secs: 10,
            event_poll_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), file: None }
    }
}

impl EngineConfig {
    pub fn harvest_timeout(&self) -> Duration {
        Duration::from_millis(self.harvest_timeout_ms)
    }

    pub fn standby(&self) -> Duration {
        Duration::from_secs(self.standby_secs)
    }
}

impl HotswapConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms)
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: NodeConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback
    ///
    /// runs before logging is initialized, so problems are returned as
    /// messages for the caller to log once the subscriber is installed.
    pub fn load_or_default() -> (Self, Vec<String>) {
        let paths = [
            PathBuf::from("config").join("node.toml"),
            PathBuf::from("..").join("config").join("node.toml"),
        ];
        let mut notes = Vec::new();

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        notes.push(format!("loaded config from {}", path.display()));
                        return (config, notes);
                    }
                    Err(e) => {
                        notes.push(format!("failed to load {}: {}", path.display(), e));
                    }
                }
            }
        }

        notes.push("no config file found - using defaults".to_string());
        (Self::default(), notes)
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!(
            identity_file = %self.device.identity_file.display(),
            ledger = %self.ledger.url,
            harvest_timeout_ms = self.engine.harvest_timeout_ms,
            standby_secs = self.engine.standby_secs,
            hotswap_interval_secs = self.hotswap.interval_secs,
            retry_interval_secs = self.failover.retry_interval_secs,
            log_level = %self.logging.level,
            "node configuration"
        );
    }
}
