use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Raw `{errors, data}` envelope returned by every resource endpoint.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub errors: Vec<BridgeErrorEntry>,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeErrorEntry {
    #[serde(default)]
    pub description: String,
}

/// Decoded resource collection. Elements that failed to deserialize are
/// dropped and counted in `malformed`.
#[derive(Debug, Clone)]
pub struct Resources<T> {
    pub items: Vec<T>,
    pub malformed: usize,
}

impl<T> Default for Resources<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            malformed: 0,
        }
    }
}

impl<T> From<Vec<T>> for Resources<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items, malformed: 0 }
    }
}

impl<T: DeserializeOwned> Resources<T> {
    pub fn decode(envelope: Envelope, resource: &str) -> Self {
        for err in &envelope.errors {
            warn!("Bridge reported error on {} resource: {}", resource, err.description);
        }

        let mut out = Resources::default();
        for value in envelope.data {
            match serde_json::from_value::<T>(value) {
                Ok(item) => out.items.push(item),
                Err(e) => {
                    debug!("Skipping malformed {} resource: {}", resource, e);
                    out.malformed += 1;
                }
            }
        }
        if out.malformed > 0 {
            warn!("Skipped {} malformed {} resources", out.malformed, resource);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    pub rid: String,
    #[serde(default)]
    pub rtype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionResource {
    pub id: String,
    pub owner: ResourceRef,
    #[serde(default)]
    pub motion: Option<MotionState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionState {
    #[serde(default)]
    pub motion_report: Option<MotionReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionReport {
    pub changed: DateTime<Utc>,
    pub motion: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureResource {
    pub id: String,
    pub owner: ResourceRef,
    #[serde(default)]
    pub temperature: Option<TemperatureState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureState {
    #[serde(default)]
    pub temperature_report: Option<TemperatureReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureReport {
    pub changed: DateTime<Utc>,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResource {
    pub id: String,
    #[serde(default)]
    pub metadata: Option<DeviceMetadata>,
}

impl DeviceResource {
    pub fn name(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePowerResource {
    pub id: String,
    pub owner: ResourceRef,
    #[serde(default)]
    pub power_state: Option<PowerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerState {
    #[serde(default)]
    pub battery_state: Option<String>,
    #[serde(default)]
    pub battery_level: Option<i64>,
}
