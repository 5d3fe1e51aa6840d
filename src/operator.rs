//! ==============================================================================
//! operator.rs - turns cached requirements into engine schedules
//! ==============================================================================
//! ```text
//!
//! purpose:
//!     owns the reading engine's run loop and every requirement schedule.
//!
//!     - `CacheRefreshed`      -> schedule every cached requirement
//!     - `RequirementUpserted` -> replace that requirement's schedule
//!     - `RequirementRemoved`  -> cancel it and drop it from the cache
//!
//!     any prior schedule for an id is canceled before its replacement is
//!     installed. one-shot requirements (zero period) are read once and
//!     removed from the cache right away.
//!
//! results:
//!     each delivery becomes a `MetricReadingRecord` posted to the ledger.
//!     when the ledger is unreachable the record goes out as
//!     `MetricReadingsPostFailed` for the failover handler.
//!
//! ```
//! ==============================================================================

use crate::device::Device;
use crate::domain::{unix_timestamp, MetricReadingRecord, Requirement};
use crate::engine::{result_handler, ResultHandler};
use crate::error::ModuleError;
use crate::events::{event_handler, Topic};
use crate::module::{Module, ModuleBase};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct EngineOperator {
    base: ModuleBase,
    scheduling: Arc<tokio::sync::Mutex<()>>,
}

impl EngineOperator {
    pub fn new() -> Self {
        Self { base: ModuleBase::new(), scheduling: Arc::new(tokio::sync::Mutex::new(())) }
    }
}

impl Default for EngineOperator {
    fn default() -> Self {
        Self::new()
    }
}

/// post one delivery for `asset_id`, routing network absence to failover
fn posting_handler(device: Arc<Device>, requirement_id: String, asset_id: String) -> ResultHandler {
    result_handler(move |values| {
        let device = device.clone();
        let requirement_id = requirement_id.clone();
        let asset_id = asset_id.clone();
        async move {
            if values.is_empty() {
                tracing::debug!(requirement = %requirement_id, "no values harvested");
                return;
            }
            let Some(device_id) = device.identity.device_id() else {
                tracing::warn!(requirement = %requirement_id, "not logged in; reading discarded");
                return;
            };
            let record = MetricReadingRecord { asset_id, device_id, timestamp: unix_timestamp(), values };
            match device.ledger.post_reading(&record).await {
                Ok(()) => tracing::debug!(requirement = %requirement_id, asset = %record.asset_id, "reading posted"),
                Err(e) if e.is_network_absence() => {
                    tracing::info!(requirement = %requirement_id, error = %e, "ledger unreachable; handing reading to failover");
                    if let Err(e) = device.bus.publish(Topic::MetricReadingsPostFailed, record).await {
                        tracing::error!(requirement = %requirement_id, error = %e, "reading lost");
                    }
                }
                Err(e) => tracing::warn!(requirement = %requirement_id, error = %e, "posting reading failed"),
            }
        }
    })
}

/// install `requirement`, canceling whatever was scheduled for its id
pub fn schedule(device: &Arc<Device>, requirement: Requirement) {
    if let Some(previous) = device.cache.requirements.get(&requirement.id) {
        previous.cancel_schedule();
    }
    requirement.cancel_schedule();

    let handler = posting_handler(device.clone(), requirement.id.clone(), requirement.asset_id.clone());
    if requirement.is_one_shot() {
        device.engine.send_once(handler, requirement.metrics.clone());
        device.cache.requirements.remove(&requirement.id);
        tracing::info!(requirement = %requirement.id, "one-shot reading requested");
        return;
    }

    let token = device.engine.subscribe(handler, requirement.period, requirement.metrics.clone());
    tracing::info!(requirement = %requirement.id, period = ?requirement.period, "requirement scheduled");
    device.cache.requirements.put(Requirement { cancel: Some(token), ..requirement });
}

pub fn unschedule(device: &Device, requirement_id: &str) {
    if let Some(previous) = device.cache.requirements.remove(requirement_id) {
        previous.cancel_schedule();
        tracing::info!(requirement = %requirement_id, "requirement unscheduled");
    }
}

#[async_trait]
impl Module for EngineOperator {
    fn id(&self) -> &'static str {
        "operator"
    }

    async fn setup(&self, device: &Arc<Device>) -> Result<(), ModuleError> {
        self.base.bind(device);

        let target = device.clone();
        let lock = self.scheduling.clone();
        self.base.track(device.bus.subscribe(
            Topic::CacheRefreshed,
            event_handler(move |_event| {
                let device = target.clone();
                let lock = lock.clone();
                async move {
                    let _serial = lock.lock().await;
                    for requirement in device.cache.requirements.list() {
                        schedule(&device, requirement);
                    }
                    Ok(())
                }
            }),
        ));

        let target = device.clone();
        let lock = self.scheduling.clone();
        self.base.track(device.bus.subscribe(
            Topic::RequirementUpserted,
            event_handler(move |event| {
                let device = target.clone();
                let lock = lock.clone();
                async move {
                    let requirement = event.payload::<Requirement>()?.clone();
                    let _serial = lock.lock().await;
                    schedule(&device, requirement);
                    Ok(())
                }
            }),
        ));

        let target = device.clone();
        let lock = self.scheduling.clone();
        self.base.track(device.bus.subscribe(
            Topic::RequirementRemoved,
            event_handler(move |event| {
                let device = target.clone();
                let lock = lock.clone();
                async move {
                    let id = event.payload::<String>()?.clone();
                    let _serial = lock.lock().await;
                    unschedule(&device, &id);
                    Ok(())
                }
            }),
        ));
        Ok(())
    }

    async fn start(&self, scope: CancellationToken) {
        if !self.base.try_start() {
            return;
        }
        if let Some(device) = self.base.device() {
            device.engine.run(scope);
        }
    }

    async fn close(&self) -> Result<(), ModuleError> {
        self.base.release();
        if let Some(device) = self.base.device() {
            for requirement in device.cache.requirements.list() {
                requirement.cancel_schedule();
            }
        }
        Ok(())
    }
}
