//! ==============================================================================
//! main.rs - field node entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the node together and keeps it running until ctrl-c.
//!
//! responsibilities:
//!     - load configuration and initialize logging
//!     - open the failover queue (the node refuses to start without it)
//!     - pick the i2c provider: rppal with `--features hardware`, mock otherwise
//!     - build the reading engine with the cpu thermal zone preloaded;
//!       preloaded sensors are the static set hotswap leaves alone
//!     - register and start every module, then tear down in reverse
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                         device                               │
//!     │   config · event bus · ledger · cache · engine · identity    │
//!     └──────┬──────────┬──────────┬──────────┬──────────┬───────────┘
//!            │          │          │          │          │
//!      lifecycle     cache      events    operator   failover   hotswap   commands
//!     (register,   (geo query) (ledger    (engine    (redb      (i2c      (remote
//!      login)                   streams)   schedules) queue)     sweeps)   commands)
//!
//! shutdown order:
//!     root scope canceled -> modules closed in reverse -> engine closed
//!     -> event bus closed.
//!
//! ==============================================================================

use anyhow::{Context, Result};
use field_node::cache_manager::CacheManager;
use field_node::commands::CommandsListener;
use field_node::config::NodeConfig;
use field_node::device::Device;
use field_node::engine::ReadingEngine;
use field_node::events::EventBus;
use field_node::failover::FailoverHandler;
use field_node::hal::BusProvider;
use field_node::hotswap::HotswapDetector;
use field_node::ledger::http::HttpLedger;
use field_node::lifecycle::LifecycleManager;
use field_node::logging::init_logging;
use field_node::module::ModuleRegistry;
use field_node::observer::EventsObserver;
use field_node::operator::EngineOperator;
use field_node::scanner::{ChipIdCatalog, I2cScanner};
use field_node::sensors::{SensorRegister, SharedSensor, ThermalZoneSensor};
use field_node::store::{ReadingStore, RedbQueue};
use std::sync::Arc;

#[cfg(feature = "hardware")]
fn bus_provider(config: &NodeConfig) -> Arc<dyn BusProvider> {
    Arc::new(field_node::hal::PiBus::new(config.hotswap.buses.clone()))
}

#[cfg(not(feature = "hardware"))]
fn bus_provider(config: &NodeConfig) -> Arc<dyn BusProvider> {
    Arc::new(field_node::hal::MockBus::new(config.hotswap.buses.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: configuration and logging
    let (config, notes) = NodeConfig::load_or_default();
    init_logging(&config.logging)?;
    for note in &notes {
        tracing::info!("{}", note);
    }
    config.print_summary();

    // step 2: failover queue
    let store: Arc<dyn ReadingStore> = Arc::new(
        RedbQueue::open(&config.failover.store_path)
            .with_context(|| format!("opening failover store {}", config.failover.store_path.display()))?,
    );

    // step 3: sensors and discovery
    let provider = bus_provider(&config);
    let scanner = Arc::new(I2cScanner::new(
        provider,
        Arc::new(ChipIdCatalog::new(config.hotswap.chips.clone())),
        config.hotswap.address_start..=config.hotswap.address_end,
        config.hotswap.bus_timeout(),
    ));
    let register = Arc::new(SensorRegister::new());
    register.register([Arc::new(ThermalZoneSensor::zone0()) as SharedSensor]);
    let engine = Arc::new(ReadingEngine::new(register, config.engine.harvest_timeout(), config.engine.standby()));

    // step 4: device context
    let ledger = Arc::new(HttpLedger::new(&config.ledger).context("building ledger client")?);
    let bus = EventBus::new(config.events.buffer);
    let device = Arc::new(Device::new(config, bus.clone(), ledger, engine.clone()));

    // step 5: modules
    let mut registry = ModuleRegistry::new();
    registry.register(Arc::new(LifecycleManager::new()));
    registry.register(Arc::new(CacheManager::new()));
    registry.register(Arc::new(EventsObserver::new()));
    registry.register(Arc::new(EngineOperator::new()));
    registry.register(Arc::new(FailoverHandler::new(store)));
    registry.register(Arc::new(HotswapDetector::new(scanner)));
    registry.register(Arc::new(CommandsListener::new()));

    registry.setup(&device).await;
    registry.start(device.scope()).await;
    tracing::info!(modules = ?registry.ready(), "field node running");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    device.shutdown();
    registry.close().await;
    engine.close().await;
    bus.close();
    tracing::info!("field node stopped");
    Ok(())
}
