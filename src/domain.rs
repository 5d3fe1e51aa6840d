use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// a named physical quantity a sensor can report (e.g. "temperature")
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metric(String);

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Metric {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// a measured value kept in its canonical decimal rendering
///
/// the rendering matters: aggregation prefers the reading reported with the
/// most fractional digits, so `1.00` beats `1.0` even though both are equal
/// as floats.
#[derive(Clone, Debug, PartialEq)]
pub struct Decimal {
    text: String,
    value: f64,
}

impl Decimal {
    /// parse a decimal literal such as "21.50" or "-3"
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let digits = text.strip_prefix('-').unwrap_or(text);
        let mut parts = digits.splitn(2, '.');
        let int_part = parts.next().unwrap_or("");
        let frac_part = parts.next();
        let valid_int = !int_part.is_empty() && int_part.bytes().all(|b| b.is_ascii_digit());
        let valid_frac = frac_part.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()));
        if !valid_int || !valid_frac {
            return None;
        }
        let value = text.parse::<f64>().ok()?;
        Some(Self { text: text.to_string(), value })
    }

    /// render a float with a fixed number of fractional digits
    pub fn from_f64(value: f64, fractional_digits: usize) -> Self {
        Self { text: format!("{:.*}", fractional_digits, value), value }
    }

    /// number of fractional digits in the canonical rendering
    pub fn precision(&self) -> usize {
        self.text.split_once('.').map_or(0, |(_, frac)| frac.len())
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// one value produced by one sensor during a harvest
#[derive(Clone, Debug, PartialEq)]
pub struct ReadingResult {
    pub sensor_id: String,
    pub value: Decimal,
}

/// aggregated output of a reading request: metric -> selected value
pub type MetricValues = BTreeMap<Metric, f64>;

/// geographic point (decimal degrees)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn is_set(&self) -> bool {
        self.latitude != 0.0 && self.longitude != 0.0
    }

    /// great-circle distance in metres (haversine)
    pub fn distance_m(&self, other: &Location) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// operational state the ledger tracks for a device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalState {
    Pending,
    Active,
    Paused,
    Faulty,
}

/// advertised capabilities of this node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpecs {
    pub hostname: String,
    pub ip_address: String,
    pub metrics: Vec<Metric>,
}

/// locally cached snapshot of the device record held by the ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub state: OperationalState,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub specs: DeviceSpecs,
    #[serde(default)]
    pub battery: Option<u8>,
}

/// partial device update sent to the ledger; absent fields are untouched
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<OperationalState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specs: Option<DeviceSpecs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
}

/// tracked physical item as returned by geo queries
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub location: Option<Location>,
}

/// requirement as declared on the ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub id: String,
    pub asset_id: String,
    /// repeat period in seconds; zero means read once
    pub period_secs: u64,
    pub metrics: Vec<Metric>,
}

/// cached requirement plus the cancellation handle of its schedule
#[derive(Clone, Debug)]
pub struct Requirement {
    pub id: String,
    pub asset_id: String,
    pub period: Duration,
    pub metrics: Vec<Metric>,
    pub cancel: Option<CancellationToken>,
}

impl Requirement {
    /// cancel the schedule attached to this requirement, if any
    pub fn cancel_schedule(&self) {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
    }

    pub fn is_one_shot(&self) -> bool {
        self.period.is_zero()
    }
}

impl From<RequirementSpec> for Requirement {
    fn from(spec: RequirementSpec) -> Self {
        Self {
            id: spec.id,
            asset_id: spec.asset_id,
            period: Duration::from_secs(spec.period_secs),
            metrics: spec.metrics,
            cancel: None,
        }
    }
}

/// reading record posted to the ledger and persisted on failover
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricReadingRecord {
    pub asset_id: String,
    pub device_id: String,
    /// unix timestamp in seconds
    pub timestamp: u64,
    pub values: MetricValues,
}

/// diff between the live bus view and the sensor register
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SensorsDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SensorsDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// current unix time in seconds
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
