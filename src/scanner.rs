//! ==============================================================================
//! scanner.rs - i2c bus discovery
//! ==============================================================================
//!
//! purpose:
//!     sweeps every bus the provider exposes and turns acknowledging
//!     addresses into sensors. a `SensorCatalog` decides what sits at an
//!     address and hands back a factory for it.
//!
//! concurrency:
//!     buses are swept concurrently on blocking workers. each sweep is
//!     bounded by the per-bus timeout and fills only its own slot of the
//!     report, so one stuck bus never stalls the others.
//!
//! relationships:
//!     - used by: hotswap.rs
//!     - uses: hal.rs (BusProvider), sensors/linear.rs (ChipSpec, LinearSensor)
//!
//! ==============================================================================

use crate::error::SensorError;
use crate::hal::BusProvider;
use crate::sensors::{ChipSpec, LinearSensor, SharedSensor};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// builds the sensor living at an identified address
pub type SensorFactory = Box<dyn FnOnce() -> SharedSensor + Send>;

/// maps an acknowledging address to the sensor found there
pub trait SensorCatalog: Send + Sync {
    /// blocking: may read registers to tell chips apart
    fn identify(&self, provider: &Arc<dyn BusProvider>, bus: u8, addr: u8) -> Option<SensorFactory>;
}

/// identifies chips by reading their id register
pub struct ChipIdCatalog {
    chips: Vec<ChipSpec>,
}

impl ChipIdCatalog {
    pub fn new(chips: Vec<ChipSpec>) -> Self {
        Self { chips }
    }
}

impl SensorCatalog for ChipIdCatalog {
    fn identify(&self, provider: &Arc<dyn BusProvider>, bus: u8, addr: u8) -> Option<SensorFactory> {
        for chip in self.chips.iter().filter(|c| c.addresses.contains(&addr)) {
            match provider.read_register(bus, addr, chip.id_register, 1) {
                Ok(id) if id.first() == Some(&chip.chip_id) => {
                    let chip = chip.clone();
                    let provider = provider.clone();
                    return Some(Box::new(move || Arc::new(LinearSensor::new(chip, provider, bus, addr))));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(bus, addr, chip = %chip.name, error = %e, "id register read failed"),
            }
        }
        None
    }
}

/// outcome of one sweep across all buses
#[derive(Default)]
pub struct ScanReport {
    pub found: BTreeMap<u8, Vec<SharedSensor>>,
    /// buses whose sweep timed out or failed
    pub incomplete: BTreeSet<u8>,
}

impl ScanReport {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }

    pub fn detected_ids(&self) -> BTreeSet<String> {
        self.found.values().flatten().map(|s| s.id().to_string()).collect()
    }

    pub fn sensors(&self) -> impl Iterator<Item = &SharedSensor> {
        self.found.values().flatten()
    }
}

#[async_trait]
pub trait BusScanner: Send + Sync {
    async fn scan(&self) -> ScanReport;
}

pub struct I2cScanner {
    provider: Arc<dyn BusProvider>,
    catalog: Arc<dyn SensorCatalog>,
    addresses: RangeInclusive<u8>,
    bus_timeout: Duration,
}

impl I2cScanner {
    pub fn new(
        provider: Arc<dyn BusProvider>,
        catalog: Arc<dyn SensorCatalog>,
        addresses: RangeInclusive<u8>,
        bus_timeout: Duration,
    ) -> Self {
        Self { provider, catalog, addresses, bus_timeout }
    }
}

fn sweep_bus(
    provider: &Arc<dyn BusProvider>,
    catalog: &dyn SensorCatalog,
    bus: u8,
    addresses: RangeInclusive<u8>,
) -> Result<Vec<SharedSensor>, SensorError> {
    let mut sensors = Vec::new();
    for addr in addresses {
        if !provider.probe(bus, addr)? {
            continue;
        }
        match catalog.identify(provider, bus, addr) {
            Some(factory) => sensors.push(factory()),
            None => tracing::trace!(bus, addr, "unknown device acknowledged"),
        }
    }
    Ok(sensors)
}

#[async_trait]
impl BusScanner for I2cScanner {
    async fn scan(&self) -> ScanReport {
        let buses = self.provider.buses();
        let mut sweeps = JoinSet::new();
        for bus in buses {
            let provider = self.provider.clone();
            let catalog = self.catalog.clone();
            let addresses = self.addresses.clone();
            let limit = self.bus_timeout;
            sweeps.spawn(async move {
                let sweep = tokio::task::spawn_blocking(move || sweep_bus(&provider, catalog.as_ref(), bus, addresses));
                let outcome = match tokio::time::timeout(limit, sweep).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => Err(SensorError::Bus(format!("sweep task failed: {}", e))),
                    Err(_) => Err(SensorError::Bus(format!("sweep exceeded {:?}", limit))),
                };
                (bus, outcome)
            });
        }

        let mut report = ScanReport::default();
        while let Some(joined) = sweeps.join_next().await {
            match joined {
                Ok((bus, Ok(sensors))) => {
                    report.found.insert(bus, sensors);
                }
                Ok((bus, Err(e))) => {
                    tracing::warn!(bus, error = %e, "bus sweep incomplete");
                    report.incomplete.insert(bus);
                }
                Err(e) => tracing::error!(error = %e, "bus sweep task panicked"),
            }
        }
        report
    }
}
