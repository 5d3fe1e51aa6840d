//! virtual sensor backed by the kernel thermal zone (cpu temperature)

use super::{ReadingWriter, Sensor};
use crate::domain::{Decimal, Metric};
use crate::error::SensorError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub const CPU_TEMPERATURE: &str = "cpu_temperature";

/// Reports `cpu_temperature` from a sysfs thermal zone.
///
/// sysfs returns millidegrees celsius (e.g. 45000 = 45.0 C), so readings are
/// rendered with three fractional digits.
pub struct ThermalZoneSensor {
    id: String,
    path: PathBuf,
    metrics: Vec<Metric>,
    active: AtomicBool,
}

impl ThermalZoneSensor {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            metrics: vec![Metric::from(CPU_TEMPERATURE)],
            active: AtomicBool::new(false),
        }
    }

    /// the standard raspberry pi thermal zone
    pub fn zone0() -> Self {
        Self::new("thermal-zone0", "/sys/class/thermal/thermal_zone0/temp")
    }

    async fn read_millidegrees(&self) -> Result<i64, SensorError> {
        let path = self.path.clone();
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| SensorError::Harvest {
            sensor: self.id.clone(),
            reason: format!("{}: {}", path.display(), e),
        })?;
        raw.trim().parse::<i64>().map_err(|e| SensorError::Harvest {
            sensor: self.id.clone(),
            reason: format!("unexpected thermal value {:?}: {}", raw.trim(), e),
        })
    }
}

#[async_trait]
impl Sensor for ThermalZoneSensor {
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
        self.verify().await.map_err(|e| SensorError::Init {
            sensor: self.id.clone(),
            reason: e.to_string(),
        })?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn harvest(&self, out: &ReadingWriter) -> Result<(), SensorError> {
        let milli = self.read_millidegrees().await?;
        out.write(&self.metrics[0], Decimal::from_f64(milli as f64 / 1000.0, 3));
        Ok(())
    }

    async fn verify(&self) -> Result<(), SensorError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(SensorError::Verify {
                sensor: self.id.clone(),
                reason: format!("{} is not a file", self.path.display()),
            }),
            Err(e) => Err(SensorError::Verify { sensor: self.id.clone(), reason: e.to_string() }),
        }
    }

    async fn close(&self) -> Result<(), SensorError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}
