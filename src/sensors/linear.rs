//! i2c sensor whose value is a signed 16-bit register times a scale factor

use super::{ReadingWriter, Sensor};
use crate::domain::{Decimal, Metric};
use crate::error::SensorError;
use crate::hal::BusProvider;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// how to identify and read one kind of chip
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChipSpec {
    pub name: String,
    pub addresses: Vec<u8>,
    pub id_register: u8,
    pub chip_id: u8,
    pub metric: String,
    pub value_register: u8,
    pub scale: f64,
    #[serde(default = "default_precision")]
    pub precision: usize,
}

fn default_precision() -> usize {
    2
}

pub struct LinearSensor {
    id: String,
    spec: ChipSpec,
    bus: u8,
    addr: u8,
    provider: Arc<dyn BusProvider>,
    metrics: Vec<Metric>,
    active: AtomicBool,
}

impl LinearSensor {
    pub fn new(spec: ChipSpec, provider: Arc<dyn BusProvider>, bus: u8, addr: u8) -> Self {
        Self {
            id: format!("{}-{}-{:02x}", spec.name, bus, addr),
            metrics: vec![Metric::new(spec.metric.clone())],
            spec,
            bus,
            addr,
            provider,
            active: AtomicBool::new(false),
        }
    }

    async fn read(&self, register: u8, len: usize) -> Result<Vec<u8>, SensorError> {
        let provider = self.provider.clone();
        let (bus, addr) = (self.bus, self.addr);
        tokio::task::spawn_blocking(move || provider.read_register(bus, addr, register, len))
            .await
            .map_err(|e| SensorError::Bus(format!("task join error: {}", e)))?
    }
}

#[async_trait]
impl Sensor for LinearSensor {
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
        let provider = self.provider.clone();
        let (bus, addr) = (self.bus, self.addr);
        let present = tokio::task::spawn_blocking(move || provider.probe(bus, addr))
            .await
            .map_err(|e| SensorError::Bus(format!("task join error: {}", e)))?
            .map_err(|e| SensorError::Init { sensor: self.id.clone(), reason: e.to_string() })?;
        if !present {
            return Err(SensorError::Init { sensor: self.id.clone(), reason: "no acknowledge".into() });
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn harvest(&self, out: &ReadingWriter) -> Result<(), SensorError> {
        let raw = self
            .read(self.spec.value_register, 2)
            .await
            .map_err(|e| SensorError::Harvest { sensor: self.id.clone(), reason: e.to_string() })?;
        let bytes: [u8; 2] = raw
            .get(..2)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| SensorError::Harvest { sensor: self.id.clone(), reason: "short read".into() })?;
        let counts = i16::from_be_bytes(bytes);
        out.write(&self.metrics[0], Decimal::from_f64(counts as f64 * self.spec.scale, self.spec.precision));
        Ok(())
    }

    async fn verify(&self) -> Result<(), SensorError> {
        let id = self.read(self.spec.id_register, 1).await?;
        if id.first() == Some(&self.spec.chip_id) {
            Ok(())
        } else {
            Err(SensorError::Verify {
                sensor: self.id.clone(),
                reason: format!("expected chip id 0x{:02X}, read {:02X?}", self.spec.chip_id, id),
            })
        }
    }

    async fn close(&self) -> Result<(), SensorError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}
