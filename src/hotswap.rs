//! ==============================================================================
//! hotswap.rs - keeps the sensor register in step with the buses
//! ==============================================================================
//!
//! purpose:
//!     on a fixed interval, sweeps the buses and diffs what answered against
//!     the register. sensors registered before the engine was built, and
//!     any extra ids listed in `device.static_sensors`, are never removed.
//!     a non-empty diff is applied to the engine first and then published,
//!     so subscribers always find the register already matching it.
//!
//! partial sweeps:
//!     when a bus timed out or failed, the sweep cannot prove anything is
//!     gone, so removals are skipped for that round. additions still apply.
//!
//! ==============================================================================

use crate::device::Device;
use crate::domain::SensorsDiff;
use crate::error::ModuleError;
use crate::events::Topic;
use crate::module::{Module, ModuleBase};
use crate::scanner::BusScanner;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// `added = detected - registered`,
/// `removed = registered - detected - static`
pub fn diff(registered: &BTreeSet<String>, detected: &BTreeSet<String>, fixed: &BTreeSet<String>) -> SensorsDiff {
    SensorsDiff {
        added: detected.difference(registered).cloned().collect(),
        removed: registered
            .iter()
            .filter(|id| !detected.contains(*id) && !fixed.contains(*id))
            .cloned()
            .collect(),
    }
}

pub struct HotswapDetector {
    base: ModuleBase,
    scanner: Arc<dyn BusScanner>,
}

impl HotswapDetector {
    pub fn new(scanner: Arc<dyn BusScanner>) -> Self {
        Self { base: ModuleBase::new(), scanner }
    }
}

/// one sweep: diff, apply, publish
pub async fn sweep(device: &Device, scanner: &dyn BusScanner) -> SensorsDiff {
    let report = scanner.scan().await;
    let mut fixed = device.engine.preloaded().clone();
    fixed.extend(device.config.device.static_sensors.iter().cloned());
    let registered = device.engine.sensors().ids();

    let mut changes = diff(&registered, &report.detected_ids(), &fixed);
    if !report.is_complete() && !changes.removed.is_empty() {
        tracing::warn!(
            buses = ?report.incomplete,
            skipped = changes.removed.len(),
            "partial sweep; removals deferred"
        );
        changes.removed.clear();
    }
    if changes.is_empty() {
        return changes;
    }

    let added: Vec<_> = report
        .sensors()
        .filter(|s| changes.added.iter().any(|id| id == s.id()))
        .cloned()
        .collect();
    device.engine.register(added);
    device.engine.unregister(&changes.removed).await;

    tracing::info!(added = ?changes.added, removed = ?changes.removed, "sensor register changed");
    if let Err(e) = device.bus.publish(Topic::SensorsRegisterChanged, changes.clone()).await {
        tracing::warn!(error = %e, "could not publish register change");
    }
    changes
}

#[async_trait]
impl Module for HotswapDetector {
    fn id(&self) -> &'static str {
        "hotswap"
    }

    async fn setup(&self, device: &Arc<Device>) -> Result<(), ModuleError> {
        if device.config.hotswap.interval_secs == 0 {
            return Err(ModuleError::Setup { module: self.id(), reason: "interval must be positive".into() });
        }
        self.base.bind(device);
        Ok(())
    }

    async fn start(&self, scope: CancellationToken) {
        if !self.base.try_start() {
            return;
        }
        let Some(device) = self.base.device() else { return };
        let scanner = self.scanner.clone();
        let interval = device.config.hotswap.interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep(&device, scanner.as_ref()).await;
                    }
                }
            }
            tracing::debug!("hotswap detector stopped");
        });
    }

    async fn close(&self) -> Result<(), ModuleError> {
        self.base.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{test_config, test_device};
    use crate::device::Device;
    use crate::engine::ReadingEngine;
    use crate::events::{event_handler, EventBus};
    use crate::hal::MockBus;
    use crate::ledger::memory::MemoryLedger;
    use crate::scanner::{ChipIdCatalog, I2cScanner, ScanReport};
    use crate::sensors::linear::tests::tmp_spec;
    use crate::sensors::mock::MockSensor;
    use crate::sensors::{SensorRegister, SharedSensor};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn static_sensors_are_never_removed() {
        let changes = diff(&set(&["A", "B"]), &set(&["A", "C"]), &set(&["B"]));
        assert_eq!(changes.added, vec!["C".to_string()]);
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn missing_sensors_are_removed() {
        let changes = diff(&set(&["A", "B"]), &set(&["A"]), &set(&[]));
        assert!(changes.added.is_empty());
        assert_eq!(changes.removed, vec!["B".to_string()]);
    }

    struct IncompleteScan;

    #[async_trait]
    impl BusScanner for IncompleteScan {
        async fn scan(&self) -> ScanReport {
            let mut report = ScanReport::default();
            report.incomplete.insert(1);
            report
        }
    }

    #[tokio::test]
    async fn sensors_registered_at_startup_survive_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(config.device.static_sensors.is_empty());

        let register = Arc::new(SensorRegister::new());
        register.register([Arc::new(MockSensor::new("thermal-zone0", &["cpu_temperature"])) as SharedSensor]);
        let engine = Arc::new(ReadingEngine::new(register, Duration::from_millis(500), Duration::from_secs(30)));
        let device = Device::new(config, EventBus::new(16), Arc::new(MemoryLedger::new()), engine);
        device.engine.register([Arc::new(MockSensor::new("plugged", &["humidity"])) as SharedSensor]);

        let scanner = I2cScanner::new(
            Arc::new(MockBus::new(vec![1])),
            Arc::new(ChipIdCatalog::new(vec![tmp_spec()])),
            0x40..=0x4F,
            Duration::from_secs(1),
        );
        let changes = sweep(&device, &scanner).await;
        assert_eq!(changes.removed, vec!["plugged".to_string()]);
        assert_eq!(device.engine.sensors().ids(), set(&["thermal-zone0"]));
    }

    #[tokio::test]
    async fn sweep_applies_and_publishes_diff() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.device.static_sensors = vec!["thermal".into()];
        let device = test_device(config, Arc::new(MemoryLedger::new()));
        device.engine.register([
            Arc::new(MockSensor::new("thermal", &["cpu_temperature"])) as SharedSensor,
            Arc::new(MockSensor::new("gone", &["humidity"])) as SharedSensor,
        ]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = device.bus.subscribe(
            Topic::SensorsRegisterChanged,
            event_handler(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.payload::<SensorsDiff>()?.clone());
                    Ok(())
                }
            }),
        );

        let bus = Arc::new(MockBus::new(vec![1]));
        bus.attach(1, 0x48, HashMap::from([(0x0F, vec![0x75])]));
        let scanner = I2cScanner::new(
            bus,
            Arc::new(ChipIdCatalog::new(vec![tmp_spec()])),
            0x40..=0x4F,
            Duration::from_secs(1),
        );

        let changes = sweep(&device, &scanner).await;
        assert_eq!(changes.added, vec!["tmp1075-1-48".to_string()]);
        assert_eq!(changes.removed, vec!["gone".to_string()]);
        assert_eq!(device.engine.sensors().ids(), set(&["thermal", "tmp1075-1-48"]));
        assert_eq!(rx.recv().await.unwrap(), changes);

        // nothing changed on the second round
        assert!(sweep(&device, &scanner).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribers_see_the_applied_register() {
        let dir = tempfile::tempdir().unwrap();
        let device = test_device(test_config(dir.path()), Arc::new(MemoryLedger::new()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watched = device.clone();
        let _sub = device.bus.subscribe(
            Topic::SensorsRegisterChanged,
            event_handler(move |event| {
                let tx = tx.clone();
                let device = watched.clone();
                async move {
                    let changes = event.payload::<SensorsDiff>()?;
                    let register = device.engine.sensors();
                    let consistent = changes.added.iter().all(|id| register.exists(id))
                        && changes.removed.iter().all(|id| !register.exists(id));
                    let _ = tx.send(consistent);
                    Ok(())
                }
            }),
        );

        let bus = Arc::new(MockBus::new(vec![1]));
        let scanner = I2cScanner::new(
            bus.clone(),
            Arc::new(ChipIdCatalog::new(vec![tmp_spec()])),
            0x40..=0x4F,
            Duration::from_secs(1),
        );
        for round in 0..50 {
            bus.attach(1, 0x48, HashMap::from([(0x0F, vec![0x75])]));
            assert!(!sweep(&device, &scanner).await.is_empty());
            assert!(rx.recv().await.unwrap(), "round {} attach", round);

            bus.detach(1, 0x48);
            assert!(!sweep(&device, &scanner).await.is_empty());
            assert!(rx.recv().await.unwrap(), "round {} detach", round);
        }
    }

    #[tokio::test]
    async fn partial_sweep_defers_removals() {
        let dir = tempfile::tempdir().unwrap();
        let device = test_device(test_config(dir.path()), Arc::new(MemoryLedger::new()));
        device.engine.register([Arc::new(MockSensor::new("s1", &["humidity"])) as SharedSensor]);

        let changes = sweep(&device, &IncompleteScan).await;
        assert!(changes.is_empty());
        assert!(device.engine.sensors().exists("s1"));
    }
}
