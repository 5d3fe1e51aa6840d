//! ==============================================================================
//! ledger - contract of the remote system of record
//! ==============================================================================
//!
//! purpose:
//!     the node only talks to the ledger through the `Ledger` trait. errors
//!     separate "the ledger is unreachable" (`LedgerError::NetworkAbsent`)
//!     from every other failure, because only the former goes to failover.
//!
//! subscriptions:
//!     event streams are bounded `mpsc` receivers. dropping the receiver ends
//!     the subscription.
//!
//! relationships:
//!     - implemented by: http.rs (gateway client), memory.rs (tests)
//!     - used by: lifecycle.rs, cache_manager.rs, observer.rs, operator.rs,
//!       failover.rs, commands.rs
//!
//! ==============================================================================

pub mod http;

#[cfg(test)]
pub mod memory;

use crate::domain::{Asset, DeviceInfo, DeviceUpdate, Location, Metric, MetricReadingRecord, OperationalState, RequirementSpec};
use crate::error::LedgerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DeviceEvent {
    Inserted(DeviceInfo),
    Updated(DeviceInfo),
    Removed { id: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AssetEvent {
    Inserted(Asset),
    Updated(Asset),
    Removed { id: String },
    /// the asset no longer wants readings from this node
    Unassigned { id: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RequirementEvent {
    Upserted(RequirementSpec),
    Removed { id: String, asset_id: String },
}

/// server-side filter for event subscriptions; empty fields match anything
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl EventFilter {
    pub fn hostname(hostname: impl Into<String>) -> Self {
        Self { hostname: Some(hostname.into()), device_id: None }
    }

    pub fn device(id: impl Into<String>) -> Self {
        Self { hostname: None, device_id: Some(id.into()) }
    }

    pub fn matches_device_event(&self, event: &DeviceEvent) -> bool {
        let (id, hostname) = match event {
            DeviceEvent::Inserted(d) | DeviceEvent::Updated(d) => (d.id.as_str(), Some(d.specs.hostname.as_str())),
            DeviceEvent::Removed { id } => (id.as_str(), None),
        };
        let id_ok = self.device_id.as_deref().map_or(true, |want| want == id);
        let host_ok = match (&self.hostname, hostname) {
            (Some(want), Some(have)) => want == have,
            (Some(_), None) => false,
            (None, _) => true,
        };
        id_ok && host_ok
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    Ping,
    ReadMetrics { metrics: Vec<Metric> },
    SetState { state: OperationalState },
    /// a kind this node does not understand; answered with an error
    #[serde(other)]
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub device_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn retrieve_device(&self, id: &str) -> Result<DeviceInfo, LedgerError>;

    async fn update_device(&self, id: &str, update: &DeviceUpdate) -> Result<(), LedgerError>;

    async fn unbind_device(&self, id: &str) -> Result<(), LedgerError>;

    async fn subscribe_device_events(&self, filter: EventFilter) -> Result<mpsc::Receiver<DeviceEvent>, LedgerError>;

    async fn subscribe_asset_events(&self, filter: EventFilter) -> Result<mpsc::Receiver<AssetEvent>, LedgerError>;

    async fn subscribe_requirement_events(
        &self,
        filter: EventFilter,
    ) -> Result<mpsc::Receiver<RequirementEvent>, LedgerError>;

    async fn listen_commands(&self, device_id: &str) -> Result<mpsc::Receiver<Command>, LedgerError>;

    async fn submit_command_result(&self, result: &CommandResult) -> Result<(), LedgerError>;

    async fn query_assets_near(&self, point: Location, radius_m: f64) -> Result<Vec<Asset>, LedgerError>;

    async fn query_requirements_for_assets(&self, asset_ids: &[String]) -> Result<Vec<RequirementSpec>, LedgerError>;

    async fn post_reading(&self, record: &MetricReadingRecord) -> Result<(), LedgerError>;
}
