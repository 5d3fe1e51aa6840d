//! ==============================================================================
//! failover.rs - keeps readings the ledger could not take
//! ==============================================================================
//! ```text
//!
//! purpose:
//!     every `MetricReadingsPostFailed` record is written to the durable
//!     queue and a single shared retry timer is armed. when it fires, the
//!     queue is replayed in capture order:
//!
//!     - posted               -> record deleted, next record
//!     - ledger unreachable   -> stop, keep the rest, re-arm the timer
//!     - any other failure    -> logged, record kept, next record
//!
//! timer:
//!     one deadline, one task. arming an already armed timer keeps the
//!     earlier deadline, so a steady stream of failures cannot postpone the
//!     replay indefinitely.
//!
//! ```
//! ==============================================================================

use crate::device::Device;
use crate::domain::MetricReadingRecord;
use crate::error::{ModuleError, StoreError};
use crate::events::{event_handler, Topic};
use crate::ledger::Ledger;
use crate::module::{Module, ModuleBase};
use crate::store::{decode_record, encode_record, record_key, ReadingStore, READING_PREFIX};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// run a blocking store call on the blocking pool
async fn with_store<T, F>(store: &Arc<dyn ReadingStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ReadingStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub posted: usize,
    pub failed: usize,
    pub remaining: usize,
    /// replay stopped because the ledger became unreachable again
    pub interrupted: bool,
}

/// the durable queue plus the lock that keeps `persist` out of a running
/// replay; a record merged after replay read it would be deleted unseen
pub struct FailoverQueue {
    store: Arc<dyn ReadingStore>,
    serial: tokio::sync::Mutex<()>,
}

impl FailoverQueue {
    pub fn new(store: Arc<dyn ReadingStore>) -> Self {
        Self { store, serial: tokio::sync::Mutex::new(()) }
    }

    /// persist `record`; a record already queued under the same key is merged
    /// into it, values of the newer record winning per metric
    pub async fn persist(&self, record: MetricReadingRecord) -> Result<(), StoreError> {
        let _serial = self.serial.lock().await;
        with_store(&self.store, move |store| {
            let key = record_key(&record);
            let mut merged = match store.scan_prefix(&key)?.into_iter().find(|(k, _)| *k == key) {
                Some((_, bytes)) => decode_record(&bytes)?,
                None => record.clone(),
            };
            merged.values.extend(record.values);
            store.put(&key, &encode_record(&merged)?)
        })
        .await
    }

    /// number of queued records
    pub async fn pending(&self) -> Result<usize, StoreError> {
        Ok(with_store(&self.store, |store| store.scan_prefix(READING_PREFIX)).await?.len())
    }

    /// re-post every queued record in capture order
    pub async fn replay(&self, ledger: &dyn Ledger) -> Result<ReplayReport, StoreError> {
        let _serial = self.serial.lock().await;
        let store = &self.store;
        let entries = with_store(store, |store| store.scan_prefix(READING_PREFIX)).await?;

        let mut queued = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match decode_record(&bytes) {
                Ok(record) => queued.push((key, record)),
                Err(e) => {
                    tracing::error!(%key, error = %e, "undecodable reading dropped from queue");
                    with_store(store, move |store| store.delete(&key)).await?;
                }
            }
        }
        queued.sort_by_key(|(_, record)| record.timestamp);

        let mut report = ReplayReport::default();
        let total = queued.len();
        for (index, (key, record)) in queued.into_iter().enumerate() {
            match ledger.post_reading(&record).await {
                Ok(()) => {
                    with_store(store, move |store| store.delete(&key)).await?;
                    report.posted += 1;
                }
                Err(e) if e.is_network_absence() => {
                    tracing::info!(error = %e, "ledger unreachable again; replay paused");
                    report.interrupted = true;
                    report.remaining = total - index;
                    return Ok(report);
                }
                Err(e) => {
                    tracing::warn!(asset = %record.asset_id, timestamp = record.timestamp, error = %e, "replayed reading rejected");
                    report.failed += 1;
                }
            }
        }
        report.remaining = report.failed;
        Ok(report)
    }
}

/// single shared retry deadline
#[derive(Default)]
struct RetryTimer {
    deadline: Mutex<Option<Instant>>,
    changed: Notify,
}

impl RetryTimer {
    fn arm(&self, after: Duration) {
        let mut deadline = self.deadline.lock();
        if deadline.is_none() {
            *deadline = Some(Instant::now() + after);
            self.changed.notify_one();
        }
    }

    fn take_due(&self) -> bool {
        let mut deadline = self.deadline.lock();
        match *deadline {
            Some(at) if at <= Instant::now() => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }
}

pub struct FailoverHandler {
    base: ModuleBase,
    queue: Arc<FailoverQueue>,
    timer: Arc<RetryTimer>,
}

impl FailoverHandler {
    pub fn new(store: Arc<dyn ReadingStore>) -> Self {
        Self { base: ModuleBase::new(), queue: Arc::new(FailoverQueue::new(store)), timer: Arc::new(RetryTimer::default()) }
    }
}

async fn retry_loop(device: Arc<Device>, queue: Arc<FailoverQueue>, timer: Arc<RetryTimer>, scope: CancellationToken) {
    let interval = Duration::from_secs(device.config.failover.retry_interval_secs);
    loop {
        let wake = async {
            match timer.deadline() {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = timer.changed.notified() => continue,
            _ = wake => {}
        }
        if !timer.take_due() {
            continue;
        }

        match queue.replay(device.ledger.as_ref()).await {
            Ok(report) => {
                tracing::info!(
                    posted = report.posted,
                    failed = report.failed,
                    remaining = report.remaining,
                    "failover replay finished"
                );
                if report.interrupted {
                    timer.arm(interval);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failover replay failed");
                timer.arm(interval);
            }
        }
    }
    tracing::debug!("failover retry loop stopped");
}

#[async_trait]
impl Module for FailoverHandler {
    fn id(&self) -> &'static str {
        "failover"
    }

    async fn setup(&self, device: &Arc<Device>) -> Result<(), ModuleError> {
        self.base.bind(device);
        let interval = Duration::from_secs(device.config.failover.retry_interval_secs);

        let queue = self.queue.clone();
        let timer = self.timer.clone();
        self.base.track(device.bus.subscribe(
            Topic::MetricReadingsPostFailed,
            event_handler(move |event| {
                let queue = queue.clone();
                let timer = timer.clone();
                async move {
                    let record = event.payload::<MetricReadingRecord>()?.clone();
                    let (asset, timestamp) = (record.asset_id.clone(), record.timestamp);
                    match queue.persist(record).await {
                        Ok(()) => {
                            tracing::info!(%asset, timestamp, "reading queued for retry");
                            timer.arm(interval);
                        }
                        Err(e) => tracing::error!(%asset, timestamp, error = %e, "could not queue reading"),
                    }
                    Ok(())
                }
            }),
        ));

        // readings left over from a previous run
        let pending = self.queue.pending().await?;
        if pending > 0 {
            tracing::info!(pending, "queued readings found");
            self.timer.arm(interval);
        }
        Ok(())
    }

    async fn start(&self, scope: CancellationToken) {
        if !self.base.try_start() {
            return;
        }
        if let Some(device) = self.base.device() {
            tokio::spawn(retry_loop(device, self.queue.clone(), self.timer.clone(), scope));
        }
    }

    async fn close(&self) -> Result<(), ModuleError> {
        self.base.release();
        Ok(())
    }
}
