//! ==============================================================================
//! cache_manager.rs - rebuilds the caches from the geo query
//! ==============================================================================
//!
//! purpose:
//!     whenever the device logs in or moves, asks the ledger for the assets
//!     in range and their requirements, then replaces both caches.
//!
//! relationships:
//!     - listens for `DeviceLoggedOnNetwork` and location changes
//!     - writes cache.rs, then publishes `CacheRefreshed` for operator.rs
//!
//! ==============================================================================

use crate::device::Device;
use crate::domain::Requirement;
use crate::error::{LedgerError, ModuleError};
use crate::events::{event_handler, Topic};
use crate::module::{Module, ModuleBase};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct CacheManager {
    base: ModuleBase,
    refreshing: Arc<tokio::sync::Mutex<()>>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self { base: ModuleBase::new(), refreshing: Arc::new(tokio::sync::Mutex::new(())) }
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

/// replace both caches with what the ledger reports around the device
///
/// the ledger is queried before anything is touched, so a failed query
/// leaves the previous cache and its schedules in place.
pub async fn refresh(device: &Device) -> Result<(), LedgerError> {
    let location = device.identity.location().filter(|l| l.is_set());
    let (assets, requirements) = match location {
        Some(location) => {
            let assets = device.ledger.query_assets_near(location, device.config.geo.radius_m).await?;
            let ids: Vec<String> = assets.iter().map(|a| a.id.clone()).collect();
            let requirements = if ids.is_empty() {
                Vec::new()
            } else {
                device.ledger.query_requirements_for_assets(&ids).await?
            };
            (ids, requirements)
        }
        None => {
            tracing::info!("device location unknown; no assets in range");
            (Vec::new(), Vec::new())
        }
    };

    for previous in device.cache.requirements.list() {
        previous.cancel_schedule();
    }
    device.cache.requirements.flush();
    device.cache.assets.flush();

    for id in &assets {
        device.cache.assets.put(id);
    }
    let mut kept = 0;
    for spec in requirements {
        if device.cache.assets.exists(&spec.asset_id) {
            device.cache.requirements.put(Requirement::from(spec));
            kept += 1;
        }
    }
    tracing::info!(assets = assets.len(), requirements = kept, "cache refreshed");

    if let Err(e) = device.bus.publish(Topic::CacheRefreshed, ()).await {
        tracing::warn!(error = %e, "could not announce cache refresh");
    }
    Ok(())
}

#[async_trait]
impl Module for CacheManager {
    fn id(&self) -> &'static str {
        "cache"
    }

    async fn setup(&self, device: &Arc<Device>) -> Result<(), ModuleError> {
        self.base.bind(device);
        for topic in [Topic::DeviceLoggedOnNetwork, Topic::LocationUpdated] {
            let target = device.clone();
            let refreshing = self.refreshing.clone();
            let handler = event_handler(move |_event| {
                let device = target.clone();
                let refreshing = refreshing.clone();
                async move {
                    let _serial = refreshing.lock().await;
                    if let Err(e) = refresh(&device).await {
                        tracing::warn!(%topic, error = %e, "cache refresh failed");
                    }
                    Ok(())
                }
            });
            self.base.track(device.bus.subscribe(topic, handler));
        }
        Ok(())
    }

    async fn start(&self, _scope: CancellationToken) {
        self.base.try_start();
    }

    async fn close(&self) -> Result<(), ModuleError> {
        self.base.release();
        Ok(())
    }
}
