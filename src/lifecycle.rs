//! ==============================================================================
//! lifecycle.rs - registration and login state machine
//! ==============================================================================
//! ```text
//!
//! purpose:
//!     brings the node onto the ledger and keeps it there.
//!
//! flow:
//!     Unregistered -> PendingRegistration -> LoggedIn -> Removed
//!
//!     - startup with an identity file: retrieve the device. found means
//!       LoggedIn; not found means the file is stale and registration runs.
//!     - registration: discover specs, render and advertise the payload,
//!       then wait (bounded) for the ledger to insert a device carrying our
//!       hostname. the assigned id is persisted.
//!     - removal: unbind, delete the identity file and register again.
//!
//!     every login publishes `DeviceLoggedOnNetwork` once and pushes specs.
//!     while logged in, location fixes from the pairing channel are applied
//!     and announced as `LocationUpdated`.
//!
//! ```
//! ==============================================================================

use crate::device::Device;
use crate::domain::{DeviceInfo, DeviceSpecs, Location};
use crate::error::{ModuleError, UpdateError, ValidationError};
use crate::events::{event_handler, Topic};
use crate::ledger::{DeviceEvent, EventFilter};
use crate::module::{Module, ModuleBase};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_RETRIEVE_BACKOFF: Duration = Duration::from_secs(60);

pub struct LifecycleManager {
    base: ModuleBase,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { base: ModuleBase::new() }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for LifecycleManager {
    fn id(&self) -> &'static str {
        "lifecycle"
    }

    async fn setup(&self, device: &Arc<Device>) -> Result<(), ModuleError> {
        self.base.bind(device);

        let handler_device = device.clone();
        self.base.track(device.bus.subscribe(
            Topic::DeviceRemovedFromNetwork,
            event_handler(move |event| {
                let device = handler_device.clone();
                async move {
                    let id = event.payload::<String>()?.clone();
                    let scope = device.scope().child_token();
                    tokio::spawn(async move {
                        reset(&device, &id).await;
                        register(&device, &scope).await;
                    });
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

        if let Some(updates) = device.pairing.location_updates() {
            tokio::spawn(apply_locations(device.clone(), updates, scope.clone()));
        }
        tokio::spawn(async move {
            if !resume(&device, &scope).await {
                register(&device, &scope).await;
            }
        });
    }

    async fn close(&self) -> Result<(), ModuleError> {
        self.base.release();
        Ok(())
    }
}

/// log in with the persisted identity; false when registration is needed
async fn resume(device: &Device, scope: &CancellationToken) -> bool {
    let id = match device.identity.read_id_file().await {
        Ok(Some(id)) => id,
        Ok(None) => {
            tracing::info!(file = %device.identity.file().display(), "no identity file; registering");
            return false;
        }
        Err(e) => {
            tracing::warn!(error = %e, "identity file unreadable; registering");
            return false;
        }
    };

    let mut backoff = Duration::from_millis(device.config.lifecycle.login_poll_backoff_ms.max(1));
    loop {
        match device.ledger.retrieve_device(&id).await {
            Ok(info) => {
                log_in(device, info, scope).await;
                return true;
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(device = %id, "device no longer on ledger; resetting identity");
                reset(device, &id).await;
                return false;
            }
            Err(e) => {
                tracing::warn!(device = %id, error = %e, retry_in = ?backoff, "could not confirm identity");
                tokio::select! {
                    _ = scope.cancelled() => return true,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_RETRIEVE_BACKOFF);
            }
        }
    }
}

async fn log_in(device: &Device, info: DeviceInfo, scope: &CancellationToken) {
    tracing::info!(device = %info.id, state = ?info.state, "logged on network");
    device.identity.log_in(info.clone());
    if let Err(e) = device.bus.publish(Topic::DeviceLoggedOnNetwork, info).await {
        tracing::warn!(error = %e, "could not announce login");
    }

    let specs = discover_specs(device, scope).await;
    match device.identity.set_specs(specs).await {
        Ok(()) | Err(UpdateError::Validation(ValidationError::NoChange)) => {}
        Err(e) => tracing::warn!(error = %e, "could not push device specs"),
    }
}

/// forget the current identity after the ledger dropped it
async fn reset(device: &Device, id: &str) {
    device.identity.mark_removed(id);
    tracing::warn!(device = %id, "device removed from network");

    match device.ledger.unbind_device(id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => tracing::warn!(device = %id, error = %e, "unbind failed"),
    }
    if let Err(e) = device.identity.delete_id_file().await {
        tracing::error!(error = %e, "could not delete identity file");
    }
}

async fn register(device: &Device, scope: &CancellationToken) {
    device.identity.begin_registration();
    let specs = discover_specs(device, scope).await;
    if specs.hostname.is_empty() {
        tracing::error!("no hostname available; registration abandoned");
        device.identity.abandon_registration();
        return;
    }

    // watch before showing the payload so an insertion cannot slip past
    let mut inserts = match device.ledger.subscribe_device_events(EventFilter::hostname(&specs.hostname)).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(error = %e, "cannot watch for device insertion; registration abandoned");
            device.identity.abandon_registration();
            return;
        }
    };

    let payload = json!({
        "hostname": specs.hostname,
        "ip_address": specs.ip_address,
        "metrics": specs.metrics,
    })
    .to_string();
    device.display.render(&payload);
    device.pairing.advertise(&payload);

    let timeout = Duration::from_secs(device.config.lifecycle.registration_timeout_secs);
    tracing::info!(hostname = %specs.hostname, ?timeout, "waiting for registration");
    let inserted = tokio::select! {
        _ = scope.cancelled() => None,
        found = tokio::time::timeout(timeout, next_insert(&mut inserts, device.identity.retired_id())) => found.ok().flatten(),
    };
    drop(inserts);

    let Some(info) = inserted else {
        tracing::warn!(hostname = %specs.hostname, "registration not completed; giving up");
        device.identity.abandon_registration();
        return;
    };
    if let Err(e) = device.identity.persist_id(&info.id).await {
        tracing::error!(device = %info.id, error = %e, "could not persist identity");
    }
    log_in(device, info, scope).await;
}

/// first insertion that does not carry the id the ledger just removed
async fn next_insert(events: &mut mpsc::Receiver<DeviceEvent>, retired: Option<String>) -> Option<DeviceInfo> {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::Inserted(info) if retired.as_deref() == Some(info.id.as_str()) => {
                tracing::debug!(device = %info.id, "ignoring insertion of the removed identity");
            }
            DeviceEvent::Inserted(info) => return Some(info),
            _ => {}
        }
    }
    None
}

/// network identity plus every metric the register can serve
///
/// sensors may still be enumerating at boot, so an empty metric set is
/// retried a few times before giving up.
pub async fn discover_specs(device: &Device, scope: &CancellationToken) -> DeviceSpecs {
    let lifecycle = &device.config.lifecycle;
    let hostname = device
        .config
        .device
        .hostname
        .clone()
        .or_else(sysinfo::System::host_name)
        .unwrap_or_default();
    let ip_address = match &device.config.device.ip_address {
        Some(ip) => ip.clone(),
        None => outbound_ip().await.unwrap_or_default(),
    };

    let mut metrics = Vec::new();
    for attempt in 0..lifecycle.spec_discovery_attempts.max(1) {
        metrics = device.engine.sensors().metrics().into_iter().collect();
        if !metrics.is_empty() {
            break;
        }
        tracing::debug!(attempt, "no metrics yet; waiting for sensors");
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(lifecycle.spec_discovery_backoff_ms)) => {}
        }
    }
    if metrics.is_empty() {
        tracing::warn!("no sensor metrics discovered");
    }
    DeviceSpecs { hostname, ip_address, metrics }
}

/// address of the interface used for outbound traffic; no packet is sent
async fn outbound_ip() -> Option<String> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

async fn apply_locations(device: Arc<Device>, mut updates: mpsc::Receiver<Location>, scope: CancellationToken) {
    loop {
        let location = tokio::select! {
            _ = scope.cancelled() => break,
            next = updates.recv() => match next {
                Some(location) => location,
                None => break,
            },
        };
        match device.identity.set_location(location).await {
            Ok(()) => {
                if let Err(e) = device.bus.publish(Topic::LocationUpdated, location).await {
                    tracing::warn!(error = %e, "could not announce location");
                }
            }
            Err(UpdateError::Validation(ValidationError::NoChange)) => {}
            Err(e) => tracing::warn!(error = %e, "location update refused"),
        }
    }
    tracing::debug!("location updates stopped");
}
