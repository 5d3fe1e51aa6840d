//! ==============================================================================
//! identity.rs - who this node is on the ledger
//! ==============================================================================
//!
//! purpose:
//!     owns the lifecycle state, the cached device snapshot and the identity
//!     file. the file holds the raw device id; its presence alone means
//!     "this node is registered".
//!
//! guarded writers:
//!     `set_state`, `set_location`, `set_specs` and `set_battery` refuse to
//!     run unless logged in, refuse no-op updates and validate their input.
//!     an accepted update is mirrored into the snapshot without reading the
//!     device back from the ledger.
//!
//! relationships:
//!     - driven by: lifecycle.rs
//!     - read by: cache_manager.rs (location), operator.rs (device id),
//!       commands.rs (SetState)
//!
//! ==============================================================================

use crate::domain::{DeviceInfo, DeviceSpecs, DeviceUpdate, Location, OperationalState};
use crate::error::{UpdateError, ValidationError};
use crate::ledger::Ledger;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Unregistered,
    PendingRegistration,
    LoggedIn,
    /// deleted on the ledger; local identity is being reset
    Removed,
}

struct Snapshot {
    state: LifecycleState,
    device: Option<DeviceInfo>,
    /// id the ledger last removed; never accepted again
    retired: Option<String>,
}

pub struct Identity {
    file: PathBuf,
    ledger: Arc<dyn Ledger>,
    snapshot: Mutex<Snapshot>,
    writes: tokio::sync::Mutex<()>,
}

impl Identity {
    pub fn new(file: impl Into<PathBuf>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            file: file.into(),
            ledger,
            snapshot: Mutex::new(Snapshot { state: LifecycleState::Unregistered, device: None, retired: None }),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn state(&self) -> LifecycleState {
        self.snapshot.lock().state
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == LifecycleState::LoggedIn
    }

    pub fn device(&self) -> Option<DeviceInfo> {
        self.snapshot.lock().device.clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.snapshot.lock().device.as_ref().map(|d| d.id.clone())
    }

    pub fn location(&self) -> Option<Location> {
        self.snapshot.lock().device.as_ref().and_then(|d| d.location)
    }

    /// id stored in the identity file, if the node was registered before
    pub async fn read_id_file(&self) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string(&self.file).await {
            Ok(content) => {
                let id = content.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn persist_id(&self, id: &str) -> io::Result<()> {
        if let Some(parent) = self.file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.file, id).await
    }

    pub async fn delete_id_file(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.file).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub(crate) fn begin_registration(&self) {
        self.snapshot.lock().state = LifecycleState::PendingRegistration;
    }

    pub(crate) fn abandon_registration(&self) {
        let mut snapshot = self.snapshot.lock();
        if snapshot.state == LifecycleState::PendingRegistration {
            snapshot.state = LifecycleState::Unregistered;
        }
    }

    pub(crate) fn log_in(&self, device: DeviceInfo) {
        let mut snapshot = self.snapshot.lock();
        snapshot.state = LifecycleState::LoggedIn;
        snapshot.device = Some(device);
    }

    /// forget device `id`; returns the snapshot that was dropped
    pub(crate) fn mark_removed(&self, id: &str) -> Option<DeviceInfo> {
        let mut snapshot = self.snapshot.lock();
        snapshot.state = LifecycleState::Removed;
        snapshot.retired = Some(id.to_string());
        snapshot.device.take()
    }

    pub fn retired_id(&self) -> Option<String> {
        self.snapshot.lock().retired.clone()
    }

    fn logged_in_device(&self) -> Result<DeviceInfo, ValidationError> {
        let snapshot = self.snapshot.lock();
        match (&snapshot.state, &snapshot.device) {
            (LifecycleState::LoggedIn, Some(device)) => Ok(device.clone()),
            _ => Err(ValidationError::NotLoggedIn),
        }
    }

    async fn send(&self, id: &str, update: DeviceUpdate, apply: impl FnOnce(&mut DeviceInfo)) -> Result<(), UpdateError> {
        self.ledger.update_device(id, &update).await?;
        let mut snapshot = self.snapshot.lock();
        if let Some(device) = snapshot.device.as_mut().filter(|d| d.id == id) {
            apply(device);
        }
        Ok(())
    }

    pub async fn set_state(&self, state: OperationalState) -> Result<(), UpdateError> {
        let _write = self.writes.lock().await;
        let device = self.logged_in_device()?;
        if device.state == state {
            return Err(ValidationError::NoChange.into());
        }
        let update = DeviceUpdate { state: Some(state), ..Default::default() };
        self.send(&device.id, update, |d| d.state = state).await?;
        tracing::info!(device = %device.id, ?state, "device state updated");
        Ok(())
    }

    pub async fn set_location(&self, location: Location) -> Result<(), UpdateError> {
        let _write = self.writes.lock().await;
        let device = self.logged_in_device()?;
        if !location.is_set() {
            return Err(ValidationError::InvalidLocation.into());
        }
        if device.location == Some(location) {
            return Err(ValidationError::NoChange.into());
        }
        let update = DeviceUpdate { location: Some(location), ..Default::default() };
        self.send(&device.id, update, |d| d.location = Some(location)).await?;
        tracing::info!(device = %device.id, lat = location.latitude, lon = location.longitude, "device location updated");
        Ok(())
    }

    pub async fn set_specs(&self, specs: DeviceSpecs) -> Result<(), UpdateError> {
        let _write = self.writes.lock().await;
        let device = self.logged_in_device()?;
        if specs.metrics.is_empty() {
            return Err(ValidationError::NoMetrics.into());
        }
        if specs.hostname.is_empty() || specs.ip_address.is_empty() {
            return Err(ValidationError::MissingNetworkIdentity.into());
        }
        if device.specs == specs {
            return Err(ValidationError::NoChange.into());
        }
        let update = DeviceUpdate { specs: Some(specs.clone()), ..Default::default() };
        let metrics = specs.metrics.len();
        self.send(&device.id, update, |d| d.specs = specs).await?;
        tracing::info!(device = %device.id, metrics, "device specs updated");
        Ok(())
    }

    pub async fn set_battery(&self, level: u8) -> Result<(), UpdateError> {
        let _write = self.writes.lock().await;
        let device = self.logged_in_device()?;
        if level > 100 {
            return Err(ValidationError::InvalidBattery(level).into());
        }
        if device.battery == Some(level) {
            return Err(ValidationError::NoChange.into());
        }
        let update = DeviceUpdate { battery: Some(level), ..Default::default() };
        self.send(&device.id, update, |d| d.battery = Some(level)).await?;
        tracing::debug!(device = %device.id, level, "battery level updated");
        Ok(())
    }
}
