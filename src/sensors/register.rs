use super::SharedSensor;
use crate::domain::Metric;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// Mapping of sensor id -> sensor.
///
/// Iteration order is ascending sensor id, which is also the order used for
/// first-match-wins metric selection.
#[derive(Default)]
pub struct SensorRegister {
    sensors: RwLock<BTreeMap<String, SharedSensor>>,
}

impl SensorRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// add sensors, replacing any registered under the same id
    pub fn register(&self, sensors: impl IntoIterator<Item = SharedSensor>) {
        let mut guard = self.sensors.write();
        for sensor in sensors {
            guard.insert(sensor.id().to_string(), sensor);
        }
    }

    /// remove sensors by id, returning the ones that were present
    pub fn unregister<S: AsRef<str>>(&self, ids: &[S]) -> Vec<SharedSensor> {
        let mut guard = self.sensors.write();
        ids.iter().filter_map(|id| guard.remove(id.as_ref())).collect()
    }

    /// merge another register into this one
    pub fn union(&self, other: &SensorRegister) {
        self.register(other.snapshot());
    }

    pub fn exists(&self, id: &str) -> bool {
        self.sensors.read().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<SharedSensor> {
        self.sensors.read().get(id).cloned()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.sensors.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sensors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.read().is_empty()
    }

    /// union of every metric any registered sensor supports
    pub fn metrics(&self) -> BTreeSet<Metric> {
        self.sensors
            .read()
            .values()
            .flat_map(|s| s.metrics().iter().cloned())
            .collect()
    }

    /// first sensor in iteration order that supports `metric`
    pub fn first_supporting(&self, metric: &Metric) -> Option<SharedSensor> {
        self.sensors.read().values().find(|s| s.supports(metric)).cloned()
    }

    /// copy of the current sensors, for use outside the lock
    pub fn snapshot(&self) -> Vec<SharedSensor> {
        self.sensors.read().values().cloned().collect()
    }
}
