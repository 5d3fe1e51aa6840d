//! ==============================================================================
//! sensors - the sensor capability and the register that owns sensors
//! ==============================================================================
//!
//! purpose:
//!     every physical or virtual sensor implements `Sensor`. the engine never
//!     inspects concrete types: it only asks which metrics a sensor declares,
//!     initializes it lazily, harvests into a `ReadingWriter` and closes it.
//!
//! relationships:
//!     - used by: engine.rs (harvest), hotswap.rs (register diff), scanner.rs (factories)
//!     - implemented by: thermal.rs (virtual cpu sensor), linear.rs (i2c chips), mock.rs (tests)
//!
//! ==============================================================================

pub(crate) mod linear;
mod register;
mod thermal;

#[cfg(test)]
pub mod mock;

pub use linear::{ChipSpec, LinearSensor};
pub use register::SensorRegister;
pub use thermal::ThermalZoneSensor;

use crate::domain::{Decimal, Metric, ReadingResult};
use crate::error::SensorError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait Sensor: Send + Sync {
    fn id(&self) -> &str;

    /// metrics this sensor is able to report
    fn metrics(&self) -> &[Metric];

    /// whether the underlying connection is currently open
    fn active(&self) -> bool;

    /// open the underlying connection
    async fn init(&self) -> Result<(), SensorError>;

    /// read every metric this sensor supports into `out`
    async fn harvest(&self, out: &ReadingWriter) -> Result<(), SensorError>;

    /// check that the hardware at this address is still the expected chip
    async fn verify(&self) -> Result<(), SensorError>;

    /// release the underlying connection; the sensor stays usable
    async fn close(&self) -> Result<(), SensorError>;

    fn supports(&self, metric: &Metric) -> bool {
        self.metrics().contains(metric)
    }
}

pub type SharedSensor = Arc<dyn Sensor>;

/// Sink a sensor writes its harvested values into.
///
/// one writer per (sensor, request); values for metrics the request did not
/// ask this sensor for are dropped.
#[derive(Clone)]
pub struct ReadingWriter {
    sensor_id: String,
    channels: HashMap<Metric, mpsc::UnboundedSender<ReadingResult>>,
}

impl ReadingWriter {
    pub(crate) fn new(
        sensor_id: impl Into<String>,
        channels: HashMap<Metric, mpsc::UnboundedSender<ReadingResult>>,
    ) -> Self {
        Self { sensor_id: sensor_id.into(), channels }
    }

    pub fn write(&self, metric: &Metric, value: Decimal) {
        if let Some(tx) = self.channels.get(metric) {
            let _ = tx.send(ReadingResult { sensor_id: self.sensor_id.clone(), value });
        }
    }

    pub fn wants(&self, metric: &Metric) -> bool {
        self.channels.contains_key(metric)
    }
}
