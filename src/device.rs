//! ==============================================================================
//! device.rs - the service container every module is attached to
//! ==============================================================================
//!
//! purpose:
//!     bundles the process-scoped services (event bus, ledger client, caches,
//!     reading engine, identity) plus the local display and pairing sinks.
//!     built once in main and handed to every module's `setup`.
//!
//! scope:
//!     the device owns the root cancellation token. canceling it stops every
//!     module task, every engine request and every periodic producer.
//!
//! ==============================================================================

use crate::cache::Cache;
use crate::config::NodeConfig;
use crate::domain::Location;
use crate::engine::ReadingEngine;
use crate::events::EventBus;
use crate::identity::Identity;
use crate::ledger::Ledger;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// renders the registration payload somewhere a technician can scan it
pub trait Display: Send + Sync {
    fn render(&self, payload: &str);
}

/// local short-range channel used while pairing with a technician's phone
pub trait PairingChannel: Send + Sync {
    fn advertise(&self, payload: &str);

    /// stream of location fixes pushed by the paired phone; handed out once
    fn location_updates(&self) -> Option<mpsc::Receiver<Location>>;
}

/// writes the payload to the log instead of a screen
pub struct LogDisplay;

impl Display for LogDisplay {
    fn render(&self, payload: &str) {
        tracing::info!(%payload, "registration payload");
    }
}

/// pairing is not available on this build
pub struct NoPairing;

impl PairingChannel for NoPairing {
    fn advertise(&self, _payload: &str) {
        tracing::debug!("no pairing channel; advertise skipped");
    }

    fn location_updates(&self) -> Option<mpsc::Receiver<Location>> {
        None
    }
}

pub struct Device {
    pub config: NodeConfig,
    pub bus: Arc<EventBus>,
    pub ledger: Arc<dyn Ledger>,
    pub cache: Arc<Cache>,
    pub engine: Arc<ReadingEngine>,
    pub identity: Arc<Identity>,
    pub display: Arc<dyn Display>,
    pub pairing: Arc<dyn PairingChannel>,
    scope: CancellationToken,
}

impl Device {
    pub fn new(config: NodeConfig, bus: Arc<EventBus>, ledger: Arc<dyn Ledger>, engine: Arc<ReadingEngine>) -> Self {
        let identity = Arc::new(Identity::new(config.device.identity_file.clone(), ledger.clone()));
        Self {
            config,
            bus,
            ledger,
            cache: Arc::new(Cache::new()),
            engine,
            identity,
            display: Arc::new(LogDisplay),
            pairing: Arc::new(NoPairing),
            scope: CancellationToken::new(),
        }
    }

    pub fn with_display(mut self, display: Arc<dyn Display>) -> Self {
        self.display = display;
        self
    }

    pub fn with_pairing(mut self, pairing: Arc<dyn PairingChannel>) -> Self {
        self.pairing = pairing;
        self
    }

    /// root scope; module scopes are children of it
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn shutdown(&self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
pub mod testing {
    //! helpers for building a device around the in-memory ledger

    use super::*;
    use crate::ledger::memory::MemoryLedger;
    use crate::sensors::SensorRegister;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::time::Duration;

    /// pairing double: records advertisements and replays pushed locations
    pub struct ChannelPairing {
        pub advertised: Mutex<Vec<String>>,
        updates: Mutex<Option<mpsc::Receiver<Location>>>,
    }

    impl ChannelPairing {
        pub fn new() -> (Arc<Self>, mpsc::Sender<Location>) {
            let (tx, rx) = mpsc::channel(8);
            let pairing = Arc::new(Self { advertised: Mutex::new(Vec::new()), updates: Mutex::new(Some(rx)) });
            (pairing, tx)
        }
    }

    impl PairingChannel for ChannelPairing {
        fn advertise(&self, payload: &str) {
            self.advertised.lock().push(payload.to_string());
        }

        fn location_updates(&self) -> Option<mpsc::Receiver<Location>> {
            self.updates.lock().take()
        }
    }

    pub fn test_config(dir: &Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.device.identity_file = dir.join("device.id");
        config.device.hostname = Some("node-1".into());
        config.device.ip_address = Some("10.0.0.2".into());
        config.device.static_sensors = Vec::new();
        config.failover.store_path = dir.join("readings.redb");
        config.lifecycle.login_poll_attempts = 2;
        config.lifecycle.login_poll_backoff_ms = 10;
        config.lifecycle.spec_discovery_attempts = 2;
        config.lifecycle.spec_discovery_backoff_ms = 10;
        config
    }

    pub fn build_device(config: NodeConfig, ledger: Arc<MemoryLedger>) -> Device {
        let engine = Arc::new(ReadingEngine::new(
            Arc::new(SensorRegister::new()),
            Duration::from_millis(500),
            Duration::from_secs(30),
        ));
        Device::new(config, EventBus::new(16), ledger, engine)
    }

    pub fn test_device(config: NodeConfig, ledger: Arc<MemoryLedger>) -> Arc<Device> {
        Arc::new(build_device(config, ledger))
    }
}
