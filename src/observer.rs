//! ==============================================================================
//! observer.rs - follows ledger changes while logged in
//! ==============================================================================
//! ```text
//!
//! purpose:
//!     listens to the ledger's device, asset and requirement streams and turns
//!     them into local effects:
//!
//!     - device removed          -> `DeviceRemovedFromNetwork`
//!     - asset enters range      -> asset cached, its requirements upserted
//!     - asset leaves range,
//!       removed or unassigned   -> asset dropped, its requirements removed
//!     - requirement upserted    -> `RequirementUpserted` (asset must be cached)
//!     - requirement removed     -> `RequirementRemoved`
//!
//!     the asset cache is written here. the requirement cache is written by
//!     the operator when it handles the published events, so a schedule and
//!     its cache entry always change together.
//!
//! ```
//! ==============================================================================

use crate::device::Device;
use crate::domain::{Asset, Requirement};
use crate::error::{LedgerError, ModuleError};
use crate::events::{event_handler, Topic};
use crate::ledger::{AssetEvent, DeviceEvent, EventFilter, RequirementEvent};
use crate::module::{when_logged_in, Module, ModuleBase};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct EventsObserver {
    base: ModuleBase,
    watching: Arc<Mutex<Option<(String, CancellationToken)>>>,
}

impl EventsObserver {
    pub fn new() -> Self {
        Self { base: ModuleBase::new(), watching: Arc::new(Mutex::new(None)) }
    }
}

impl Default for EventsObserver {
    fn default() -> Self {
        Self::new()
    }
}

/// open the ledger streams for the current device id; a no-op when that id
/// is already watched
async fn watch(device: Arc<Device>, watching: Arc<Mutex<Option<(String, CancellationToken)>>>, scope: CancellationToken) {
    let Some(id) = device.identity.device_id() else { return };
    let token = {
        let mut current = watching.lock();
        if matches!(&*current, Some((watched, token)) if *watched == id && !token.is_cancelled()) {
            return;
        }
        if let Some((_, previous)) = current.take() {
            previous.cancel();
        }
        let token = scope.child_token();
        *current = Some((id.clone(), token.clone()));
        token
    };

    if let Err(e) = open_streams(&device, &id, token.clone()).await {
        tracing::warn!(device = %id, error = %e, "could not subscribe to ledger events");
        token.cancel();
    }
}

async fn open_streams(device: &Arc<Device>, id: &str, token: CancellationToken) -> Result<(), LedgerError> {
    let filter = EventFilter::device(id);
    let devices = device.ledger.subscribe_device_events(filter.clone()).await?;
    let assets = device.ledger.subscribe_asset_events(filter.clone()).await?;
    let requirements = device.ledger.subscribe_requirement_events(filter).await?;

    tokio::spawn(pump(devices, token.clone(), device.clone(), |d, e| on_device_event(d, e).boxed()));
    tokio::spawn(pump(assets, token.clone(), device.clone(), |d, e| on_asset_event(d, e).boxed()));
    tokio::spawn(pump(requirements, token, device.clone(), |d, e| on_requirement_event(d, e).boxed()));
    tracing::info!(device = %id, "observing ledger events");
    Ok(())
}

async fn pump<E, F>(mut events: mpsc::Receiver<E>, token: CancellationToken, device: Arc<Device>, handle: F)
where
    E: Send + 'static,
    F: Fn(Arc<Device>, E) -> BoxFuture<'static, ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = events.recv() => match next {
                Some(event) => handle(device.clone(), event).await,
                None => {
                    tracing::warn!("ledger event stream closed");
                    break;
                }
            },
        }
    }
}

async fn announce<T: std::any::Any + Send + Sync>(device: &Device, topic: Topic, payload: T) {
    if let Err(e) = device.bus.publish(topic, payload).await {
        tracing::warn!(%topic, error = %e, "publish failed");
    }
}

pub async fn on_device_event(device: Arc<Device>, event: DeviceEvent) {
    match event {
        DeviceEvent::Removed { id } if device.identity.device_id().as_deref() == Some(id.as_str()) => {
            announce(&device, Topic::DeviceRemovedFromNetwork, id).await;
        }
        other => tracing::debug!(event = ?other, "device event ignored"),
    }
}

fn in_range(device: &Device, asset: &Asset) -> bool {
    match (device.identity.location(), asset.location) {
        (Some(here), Some(there)) => here.is_set() && here.distance_m(&there) <= device.config.geo.radius_m,
        _ => false,
    }
}

async fn drop_asset(device: &Device, asset_id: &str) {
    if !device.cache.assets.remove(asset_id) {
        return;
    }
    tracing::info!(asset = %asset_id, "asset dropped");
    for requirement in device.cache.requirements.for_asset(asset_id) {
        announce(device, Topic::RequirementRemoved, requirement.id).await;
    }
}

pub async fn on_asset_event(device: Arc<Device>, event: AssetEvent) {
    match event {
        AssetEvent::Inserted(asset) | AssetEvent::Updated(asset) => {
            if !in_range(&device, &asset) {
                drop_asset(&device, &asset.id).await;
                return;
            }
            if !device.cache.assets.put(&asset.id) {
                return;
            }
            tracing::info!(asset = %asset.id, "asset in range");
            match device.ledger.query_requirements_for_assets(&[asset.id.clone()]).await {
                Ok(specs) => {
                    for spec in specs {
                        announce(&device, Topic::RequirementUpserted, Requirement::from(spec)).await;
                    }
                }
                Err(e) => tracing::warn!(asset = %asset.id, error = %e, "could not load requirements"),
            }
        }
        AssetEvent::Removed { id } | AssetEvent::Unassigned { id } => drop_asset(&device, &id).await,
    }
}

pub async fn on_requirement_event(device: Arc<Device>, event: RequirementEvent) {
    match event {
        RequirementEvent::Upserted(spec) => {
            if device.cache.assets.exists(&spec.asset_id) {
                announce(&device, Topic::RequirementUpserted, Requirement::from(spec)).await;
            } else {
                tracing::debug!(requirement = %spec.id, asset = %spec.asset_id, "requirement for asset out of range");
            }
        }
        RequirementEvent::Removed { id, .. } => {
            if device.cache.requirements.get(&id).is_some() {
                announce(&device, Topic::RequirementRemoved, id).await;
            }
        }
    }
}

#[async_trait]
impl Module for EventsObserver {
    fn id(&self) -> &'static str {
        "events"
    }

    async fn setup(&self, device: &Arc<Device>) -> Result<(), ModuleError> {
        self.base.bind(device);
        // a re-registered node gets a new id; follow it
        let target = device.clone();
        let watching = self.watching.clone();
        self.base.track(device.bus.subscribe(
            Topic::DeviceLoggedOnNetwork,
            event_handler(move |_event| {
                let device = target.clone();
                let watching = watching.clone();
                async move {
                    let scope = device.scope().clone();
                    watch(device, watching, scope).await;
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
        let Some(device) = self.base.device() else { return };
        let watching = self.watching.clone();
        tokio::spawn(async move {
            let target = device.clone();
            when_logged_in(device, scope.clone(), move || watch(target, watching, scope)).await;
        });
    }

    async fn close(&self) -> Result<(), ModuleError> {
        self.base.release();
        if let Some((_, token)) = self.watching.lock().take() {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{test_config, test_device};
    use crate::domain::{DeviceInfo, DeviceSpecs, Location, Metric, OperationalState, RequirementSpec};
    use crate::events::Event;
    use crate::ledger::memory::MemoryLedger;
    use std::time::Duration;

    const HERE: Location = Location { latitude: 52.0, longitude: 4.0 };
    const FAR: Location = Location { latitude: 48.0, longitude: 2.0 };

    fn logged_in(ledger: Arc<MemoryLedger>) -> (tempfile::TempDir, Arc<Device>) {
        let dir = tempfile::tempdir().unwrap();
        let device = test_device(test_config(dir.path()), ledger);
        device.identity.log_in(DeviceInfo {
            id: "dev-1".into(),
            state: OperationalState::Active,
            location: Some(HERE),
            specs: DeviceSpecs::default(),
            battery: None,
        });
        (dir, device)
    }

    fn record(device: &Arc<Device>, topic: Topic) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _sub = device.bus.subscribe(
            topic,
            event_handler(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }),
        );
        rx
    }

    fn spec(id: &str, asset: &str) -> RequirementSpec {
        RequirementSpec { id: id.into(), asset_id: asset.into(), period_secs: 30, metrics: vec![Metric::from("temperature")] }
    }

    #[tokio::test]
    async fn own_removal_is_announced() {
        let (_dir, device) = logged_in(Arc::new(MemoryLedger::new()));
        let mut removed = record(&device, Topic::DeviceRemovedFromNetwork);

        on_device_event(device.clone(), DeviceEvent::Removed { id: "someone-else".into() }).await;
        on_device_event(device.clone(), DeviceEvent::Removed { id: "dev-1".into() }).await;

        let event = removed.recv().await.unwrap();
        assert_eq!(event.payload::<String>().unwrap(), "dev-1");
        assert!(removed.try_recv().is_err());
    }

    #[tokio::test]
    async fn asset_entering_range_upserts_its_requirements() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.state.lock().requirements = vec![spec("r1", "a1"), spec("r2", "other")];
        let (_dir, device) = logged_in(ledger);
        let mut upserts = record(&device, Topic::RequirementUpserted);

        on_asset_event(device.clone(), AssetEvent::Inserted(Asset { id: "far".into(), location: Some(FAR) })).await;
        assert!(!device.cache.assets.exists("far"));

        on_asset_event(device.clone(), AssetEvent::Inserted(Asset { id: "a1".into(), location: Some(HERE) })).await;
        assert!(device.cache.assets.exists("a1"));
        let event = upserts.recv().await.unwrap();
        assert_eq!(event.payload::<Requirement>().unwrap().id, "r1");
    }

    #[tokio::test]
    async fn unassigned_asset_removes_its_requirements() {
        let (_dir, device) = logged_in(Arc::new(MemoryLedger::new()));
        device.cache.assets.put("a1");
        device.cache.requirements.put(Requirement::from(spec("r1", "a1")));
        device.cache.requirements.put(Requirement::from(spec("r2", "a2")));
        let mut removals = record(&device, Topic::RequirementRemoved);

        on_asset_event(device.clone(), AssetEvent::Unassigned { id: "a1".into() }).await;
        assert!(!device.cache.assets.exists("a1"));
        assert_eq!(removals.recv().await.unwrap().payload::<String>().unwrap(), "r1");
        assert!(removals.try_recv().is_err());
    }

    #[tokio::test]
    async fn requirement_for_unknown_asset_is_ignored() {
        let (_dir, device) = logged_in(Arc::new(MemoryLedger::new()));
        device.cache.assets.put("a1");
        let mut upserts = record(&device, Topic::RequirementUpserted);

        on_requirement_event(device.clone(), RequirementEvent::Upserted(spec("r9", "elsewhere"))).await;
        on_requirement_event(device.clone(), RequirementEvent::Upserted(spec("r1", "a1"))).await;
        assert_eq!(upserts.recv().await.unwrap().payload::<Requirement>().unwrap().id, "r1");
        assert!(upserts.try_recv().is_err());
    }

    #[tokio::test]
    async fn streams_follow_the_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let (_dir, device) = logged_in(ledger.clone());
        let observer = EventsObserver::new();
        observer.setup(&device).await.unwrap();
        observer.start(device.scope().child_token()).await;

        for _ in 0..200 {
            if ledger.device_subscribers() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut removed = record(&device, Topic::DeviceRemovedFromNetwork);
        ledger.emit_device(DeviceEvent::Removed { id: "dev-1".into() }).await;
        assert_eq!(removed.recv().await.unwrap().payload::<String>().unwrap(), "dev-1");

        observer.close().await.unwrap();
        device.shutdown();
    }
}
