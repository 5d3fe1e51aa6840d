//! in-memory ledger for tests

use super::{AssetEvent, Command, CommandResult, DeviceEvent, EventFilter, Ledger, RequirementEvent};
use crate::domain::{Asset, DeviceInfo, DeviceUpdate, Location, MetricReadingRecord, RequirementSpec};
use crate::error::LedgerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

#[derive(Default)]
pub struct LedgerState {
    pub devices: HashMap<String, DeviceInfo>,
    pub assets: Vec<Asset>,
    pub requirements: Vec<RequirementSpec>,
    pub posted: Vec<MetricReadingRecord>,
    pub updates: Vec<(String, DeviceUpdate)>,
    pub unbound: Vec<String>,
    pub command_results: Vec<CommandResult>,
}

#[derive(Default)]
pub struct MemoryLedger {
    pub state: Mutex<LedgerState>,
    network_down: AtomicBool,
    post_script: Mutex<VecDeque<Result<(), LedgerError>>>,
    post_gate: Mutex<Option<Arc<Semaphore>>>,
    pub post_attempts: AtomicUsize,
    device_subs: Mutex<Vec<(EventFilter, mpsc::Sender<DeviceEvent>)>>,
    asset_subs: Mutex<Vec<mpsc::Sender<AssetEvent>>>,
    requirement_subs: Mutex<Vec<mpsc::Sender<RequirementEvent>>>,
    command_subs: Mutex<Vec<(String, mpsc::Sender<Command>)>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_network_down(&self, down: bool) {
        self.network_down.store(down, Ordering::SeqCst);
    }

    /// outcomes consumed by successive `post_reading` calls before the
    /// default of success
    pub fn script_posts(&self, outcomes: impl IntoIterator<Item = Result<(), LedgerError>>) {
        self.post_script.lock().extend(outcomes);
    }

    /// hold every `post_reading` until the returned semaphore hands out a
    /// permit for it
    pub fn gate_posts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.post_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn posted(&self) -> Vec<MetricReadingRecord> {
        self.state.lock().posted.clone()
    }

    pub fn device_subscribers(&self) -> usize {
        self.device_subs.lock().iter().filter(|(_, tx)| !tx.is_closed()).count()
    }

    pub async fn emit_device(&self, event: DeviceEvent) {
        if let DeviceEvent::Inserted(device) = &event {
            self.state.lock().devices.insert(device.id.clone(), device.clone());
        }
        let targets: Vec<_> = self
            .device_subs
            .lock()
            .iter()
            .filter(|(filter, _)| filter.matches_device_event(&event))
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub async fn emit_asset(&self, event: AssetEvent) {
        let targets: Vec<_> = self.asset_subs.lock().clone();
        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub async fn emit_requirement(&self, event: RequirementEvent) {
        let targets: Vec<_> = self.requirement_subs.lock().clone();
        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub async fn emit_command(&self, device_id: &str, command: Command) {
        let targets: Vec<_> = self
            .command_subs
            .lock()
            .iter()
            .filter(|(id, _)| id == device_id)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in targets {
            let _ = tx.send(command.clone()).await;
        }
    }

    fn online(&self) -> Result<(), LedgerError> {
        if self.network_down.load(Ordering::SeqCst) {
            Err(LedgerError::NetworkAbsent("network down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn retrieve_device(&self, id: &str) -> Result<DeviceInfo, LedgerError> {
        self.online()?;
        self.state
            .lock()
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    async fn update_device(&self, id: &str, update: &DeviceUpdate) -> Result<(), LedgerError> {
        self.online()?;
        let mut state = self.state.lock();
        let device = state.devices.get_mut(id).ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if let Some(s) = update.state {
            device.state = s;
        }
        if let Some(l) = update.location {
            device.location = Some(l);
        }
        if let Some(specs) = &update.specs {
            device.specs = specs.clone();
        }
        if let Some(b) = update.battery {
            device.battery = Some(b);
        }
        state.updates.push((id.to_string(), update.clone()));
        Ok(())
    }

    async fn unbind_device(&self, id: &str) -> Result<(), LedgerError> {
        self.online()?;
        self.state.lock().unbound.push(id.to_string());
        Ok(())
    }

    async fn subscribe_device_events(&self, filter: EventFilter) -> Result<mpsc::Receiver<DeviceEvent>, LedgerError> {
        self.online()?;
        let (tx, rx) = mpsc::channel(16);
        self.device_subs.lock().push((filter, tx));
        Ok(rx)
    }

    async fn subscribe_asset_events(&self, _filter: EventFilter) -> Result<mpsc::Receiver<AssetEvent>, LedgerError> {
        self.online()?;
        let (tx, rx) = mpsc::channel(16);
        self.asset_subs.lock().push(tx);
        Ok(rx)
    }

    async fn subscribe_requirement_events(
        &self,
        _filter: EventFilter,
    ) -> Result<mpsc::Receiver<RequirementEvent>, LedgerError> {
        self.online()?;
        let (tx, rx) = mpsc::channel(16);
        self.requirement_subs.lock().push(tx);
        Ok(rx)
    }

    async fn listen_commands(&self, device_id: &str) -> Result<mpsc::Receiver<Command>, LedgerError> {
        self.online()?;
        let (tx, rx) = mpsc::channel(16);
        self.command_subs.lock().push((device_id.to_string(), tx));
        Ok(rx)
    }

    async fn submit_command_result(&self, result: &CommandResult) -> Result<(), LedgerError> {
        self.online()?;
        self.state.lock().command_results.push(result.clone());
        Ok(())
    }

    async fn query_assets_near(&self, point: Location, radius_m: f64) -> Result<Vec<Asset>, LedgerError> {
        self.online()?;
        Ok(self
            .state
            .lock()
            .assets
            .iter()
            .filter(|a| a.location.map_or(false, |l| l.distance_m(&point) <= radius_m))
            .cloned()
            .collect())
    }

    async fn query_requirements_for_assets(&self, asset_ids: &[String]) -> Result<Vec<RequirementSpec>, LedgerError> {
        self.online()?;
        Ok(self
            .state
            .lock()
            .requirements
            .iter()
            .filter(|r| asset_ids.contains(&r.asset_id))
            .cloned()
            .collect())
    }

    async fn post_reading(&self, record: &MetricReadingRecord) -> Result<(), LedgerError> {
        self.online()?;
        self.post_attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.post_gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let scripted = self.post_script.lock().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }
        self.state.lock().posted.push(record.clone());
        Ok(())
    }
}
