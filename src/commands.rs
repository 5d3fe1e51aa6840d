//! ==============================================================================
//! commands.rs - remote commands addressed to this node
//! ==============================================================================
//!
//! purpose:
//!     once logged in, listens for commands addressed to the device and
//!     answers each one with a `CommandResult`.
//!
//! relationships:
//!     - started by `DeviceLoggedOnNetwork` or `when_logged_in`
//!     - read commands go through the engine as one-shot requests
//!     - state changes go through identity.rs
//!
//! ==============================================================================

use crate::device::Device;
use crate::domain::MetricValues;
use crate::engine::result_handler;
use crate::error::ModuleError;
use crate::events::{event_handler, Topic};
use crate::ledger::{Command, CommandKind, CommandResult};
use crate::module::{when_logged_in, Module, ModuleBase};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// slack on top of the harvest timeout before a read command gives up
const READ_GRACE: Duration = Duration::from_secs(5);

pub struct CommandsListener {
    base: ModuleBase,
    listening: Arc<Mutex<Option<(String, CancellationToken)>>>,
}

impl CommandsListener {
    pub fn new() -> Self {
        Self { base: ModuleBase::new(), listening: Arc::new(Mutex::new(None)) }
    }
}

impl Default for CommandsListener {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_once(device: &Device, metrics: Vec<crate::domain::Metric>) -> Result<MetricValues, String> {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    device.engine.send_once(
        result_handler(move |values| {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(values);
                }
            }
        }),
        metrics,
    );
    let limit = device.config.engine.harvest_timeout() + READ_GRACE;
    match tokio::time::timeout(limit, rx).await {
        Ok(Ok(values)) => Ok(values),
        Ok(Err(_)) => Err("reading request was canceled".into()),
        Err(_) => Err("reading timed out".into()),
    }
}

/// execute one command and describe the outcome
pub async fn execute(device: &Device, command: &Command) -> Result<Value, String> {
    match &command.kind {
        CommandKind::Ping => Ok(json!({ "pong": command.id })),
        CommandKind::ReadMetrics { metrics } => {
            let values = read_once(device, metrics.clone()).await?;
            serde_json::to_value(values).map_err(|e| e.to_string())
        }
        CommandKind::SetState { state } => {
            device.identity.set_state(*state).await.map_err(|e| e.to_string())?;
            Ok(json!({ "state": state }))
        }
        CommandKind::Unsupported => Err("unsupported command".into()),
    }
}

async fn answer(device: &Device, device_id: &str, command: Command) {
    let (ok, payload) = match execute(device, &command).await {
        Ok(payload) => (true, payload),
        Err(reason) => {
            tracing::warn!(command = %command.id, %reason, "command failed");
            (false, json!({ "error": reason }))
        }
    };
    let result = CommandResult { command_id: command.id, device_id: device_id.to_string(), ok, payload };
    if let Err(e) = device.ledger.submit_command_result(&result).await {
        tracing::warn!(command = %result.command_id, error = %e, "could not submit command result");
    }
}

async fn listen(device: Arc<Device>, listening: Arc<Mutex<Option<(String, CancellationToken)>>>, scope: CancellationToken) {
    let Some(id) = device.identity.device_id() else { return };
    let token = {
        let mut current = listening.lock();
        if matches!(&*current, Some((active, token)) if *active == id && !token.is_cancelled()) {
            return;
        }
        if let Some((_, previous)) = current.take() {
            previous.cancel();
        }
        let token = scope.child_token();
        *current = Some((id.clone(), token.clone()));
        token
    };

    let mut commands = match device.ledger.listen_commands(&id).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(device = %id, error = %e, "cannot listen for commands");
            token.cancel();
            return;
        }
    };
    tracing::info!(device = %id, "listening for commands");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = commands.recv() => match next {
                    Some(command) => {
                        tracing::debug!(command = %command.id, kind = ?command.kind, "command received");
                        let device = device.clone();
                        let id = id.clone();
                        tokio::spawn(async move { answer(&device, &id, command).await });
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("command listener stopped");
    });
}

#[async_trait]
impl Module for CommandsListener {
    fn id(&self) -> &'static str {
        "commands"
    }

    async fn setup(&self, device: &Arc<Device>) -> Result<(), ModuleError> {
        self.base.bind(device);
        let target = device.clone();
        let listening = self.listening.clone();
        self.base.track(device.bus.subscribe(
            Topic::DeviceLoggedOnNetwork,
            event_handler(move |_event| {
                let device = target.clone();
                let listening = listening.clone();
                async move {
                    let scope = device.scope().clone();
                    listen(device, listening, scope).await;
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
        let listening = self.listening.clone();
        tokio::spawn(async move {
            let target = device.clone();
            when_logged_in(device, scope.clone(), move || listen(target, listening, scope)).await;
        });
    }

    async fn close(&self) -> Result<(), ModuleError> {
        self.base.release();
        if let Some((_, token)) = self.listening.lock().take() {
            token.cancel();
        }
        Ok(())
    }
}
