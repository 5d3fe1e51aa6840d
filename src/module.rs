//! ==============================================================================
//! module.rs - pluggable units attached to a device
//! ==============================================================================
//!
//! purpose:
//!     every background concern of the node (lifecycle, caches, observer,
//!     operator, failover, hotswap, commands) is a `Module`. the registry
//!     drives them through setup, start and close.
//!
//! registry rules:
//!     - setup runs for every module; a failure is logged and only removes
//!       that module from the rest of the lifecycle
//!     - start runs only for modules whose setup succeeded
//!     - close runs for the same modules; close errors are logged
//!
//! ==============================================================================

use crate::device::Device;
use crate::error::ModuleError;
use crate::events::{event_handler, Subscription, Topic};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Module: Send + Sync {
    fn id(&self) -> &'static str;

    /// wire the module to the device: subscriptions, collaborators
    async fn setup(&self, device: &Arc<Device>) -> Result<(), ModuleError>;

    /// launch background activity; must not block
    async fn start(&self, scope: CancellationToken);

    /// idempotent teardown
    async fn close(&self) -> Result<(), ModuleError>;
}

/// state every module carries: its device, a run-once guard and the bus
/// subscriptions to drop on close
#[derive(Default)]
pub struct ModuleBase {
    device: OnceLock<Arc<Device>>,
    started: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ModuleBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, device: &Arc<Device>) {
        let _ = self.device.set(device.clone());
    }

    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.get().cloned()
    }

    /// true exactly once
    pub fn try_start(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn track(&self, subscription: Subscription) {
        self.subscriptions.lock().push(subscription);
    }

    pub fn release(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }
}

/// run `work` once the device is logged in
///
/// polls the identity a bounded number of times first; if login has not
/// happened by then, waits for the next `DeviceLoggedOnNetwork` publish and
/// drops that subscription again. returns without running `work` when the
/// scope is canceled first.
pub async fn when_logged_in<F, Fut>(device: Arc<Device>, scope: CancellationToken, work: F)
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let attempts = device.config.lifecycle.login_poll_attempts;
    let backoff = Duration::from_millis(device.config.lifecycle.login_poll_backoff_ms);

    for attempt in 0..attempts {
        if device.identity.is_logged_in() {
            work().await;
            return;
        }
        if attempt + 1 < attempts {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let subscription = device.bus.subscribe(
        Topic::DeviceLoggedOnNetwork,
        event_handler(move |_event| {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }
        }),
    );

    // login may have landed between the last poll and the subscription
    let ready = device.identity.is_logged_in()
        || tokio::select! {
            _ = scope.cancelled() => false,
            fired = rx => fired.is_ok(),
        };
    subscription.unsubscribe();
    if ready {
        work().await;
    }
}

pub struct ModuleRegistry {
    modules: Vec<Arc<dyn Module>>,
    ready: Vec<Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self { modules: Vec::new(), ready: Vec::new() }
    }

    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.push(module);
    }

    /// ids of the modules whose setup succeeded
    pub fn ready(&self) -> Vec<&'static str> {
        self.ready.iter().map(|m| m.id()).collect()
    }

    pub async fn setup(&mut self, device: &Arc<Device>) {
        self.ready.clear();
        for module in &self.modules {
            match module.setup(device).await {
                Ok(()) => {
                    tracing::debug!(module = module.id(), "module set up");
                    self.ready.push(module.clone());
                }
                Err(e) => tracing::error!(module = module.id(), error = %e, "module setup failed"),
            }
        }
        tracing::info!(ready = self.ready.len(), total = self.modules.len(), "modules set up");
    }

    pub async fn start(&self, scope: &CancellationToken) {
        for module in &self.ready {
            module.start(scope.child_token()).await;
            tracing::info!(module = module.id(), "module started");
        }
    }

    pub async fn close(&self) {
        for module in self.ready.iter().rev() {
            if let Err(e) = module.close().await {
                tracing::warn!(module = module.id(), error = %e, "module close failed");
            }
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
