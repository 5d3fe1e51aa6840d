//! scripted sensor for tests

use super::{ReadingWriter, Sensor};
use crate::domain::{Decimal, Metric};
use crate::error::SensorError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub struct MockSensor {
    id: String,
    metrics: Vec<Metric>,
    values: Mutex<Vec<(Metric, String)>>,
    active: AtomicBool,
    pub inits: AtomicUsize,
    pub closes: AtomicUsize,
    pub harvests: AtomicUsize,
    fail_init: AtomicBool,
    hang_init: AtomicBool,
    fail_harvest: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockSensor {
    pub fn new(id: &str, metrics: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            metrics: metrics.iter().map(|m| Metric::from(*m)).collect(),
            values: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            inits: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            harvests: AtomicUsize::new(0),
            fail_init: AtomicBool::new(false),
            hang_init: AtomicBool::new(false),
            fail_harvest: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    /// queue a value written on every harvest; repeat a metric to fan-in
    pub fn with_value(self, metric: &str, value: &str) -> Self {
        self.values.lock().push((Metric::from(metric), value.to_string()));
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn failing_init(self) -> Self {
        self.fail_init.store(true, Ordering::SeqCst);
        self
    }

    /// `init` never returns
    pub fn hanging_init(self) -> Self {
        self.hang_init.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_harvest(self) -> Self {
        self.fail_harvest.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Sensor for MockSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn init(&self) -> Result<(), SensorError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.hang_init.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(SensorError::Init { sensor: self.id.clone(), reason: "scripted".into() });
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn harvest(&self, out: &ReadingWriter) -> Result<(), SensorError> {
        self.harvests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_harvest.load(Ordering::SeqCst) {
            return Err(SensorError::Harvest { sensor: self.id.clone(), reason: "scripted".into() });
        }
        let values = self.values.lock().clone();
        for (metric, text) in values {
            if let Some(value) = Decimal::parse(&text) {
                out.write(&metric, value);
            }
        }
        Ok(())
    }

    async fn verify(&self) -> Result<(), SensorError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SensorError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}
