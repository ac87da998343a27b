use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use uuid::Uuid;

/// One simulated sensor device with a motion, temperature and power service.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub id: Uuid,
    pub name: String,
    pub motion_id: Uuid,
    pub temperature_id: Uuid,
    pub power_id: Uuid,
}

impl SimDevice {
    pub fn new(index: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: format!("Sensor {}", index + 1),
            motion_id: Uuid::new_v4(),
            temperature_id: Uuid::new_v4(),
            power_id: Uuid::new_v4(),
        }
    }

    fn owner(&self) -> Value {
        json!({ "rid": self.id, "rtype": "device" })
    }

    pub fn device_json(&self) -> Value {
        json!({
            "id": self.id,
            "type": "device",
            "metadata": { "name": self.name },
        })
    }

    pub fn motion_json(&self, rng: &mut impl Rng, now: DateTime<Utc>) -> Value {
        let changed = now - chrono::Duration::seconds(rng.gen_range(0..600));
        json!({
            "id": self.motion_id,
            "type": "motion",
            "owner": self.owner(),
            "motion": {
                "motion_report": { "changed": changed, "motion": rng.gen_bool(0.3) }
            },
        })
    }

    pub fn temperature_json(&self, rng: &mut impl Rng, now: DateTime<Utc>) -> Value {
        let temperature = if rng.gen_bool(0.02) {
            rng.gen_range(120.0..150.0) // implausible outliers
        } else {
            rng.gen_range(15.0..28.0)
        };
        json!({
            "id": self.temperature_id,
            "type": "temperature",
            "owner": self.owner(),
            "temperature": {
                "temperature_report": { "changed": now, "temperature": temperature }
            },
        })
    }

    pub fn power_json(&self, rng: &mut impl Rng) -> Value {
        let level: i64 = if rng.gen_bool(0.05) {
            rng.gen_range(0..20)
        } else {
            rng.gen_range(20..=100)
        };
        let state = if level < 20 { "low" } else { "normal" };
        json!({
            "id": self.power_id,
            "type": "device_power",
            "owner": self.owner(),
            "power_state": { "battery_state": state, "battery_level": level },
        })
    }
}

pub fn envelope(data: Vec<Value>) -> Value {
    json!({ "errors": [], "data": data })
}

pub fn token_grant(rng: &mut impl Rng, expires_in: i64) -> Value {
    json!({
        "access_token": format!("sim-access-{}", rng.gen::<u32>()),
        "refresh_token": format!("sim-refresh-{}", rng.gen::<u32>()),
        "token_type": "bearer",
        "expires_in": expires_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_reference_owning_device() {
        let device = SimDevice::new(0);
        let mut rng = rand::thread_rng();
        let motion = device.motion_json(&mut rng, Utc::now());

        assert_eq!(motion["owner"]["rid"], json!(device.id));
        assert_eq!(device.device_json()["metadata"]["name"], "Sensor 1");
        assert!(motion["motion"]["motion_report"]["motion"].is_boolean());
    }

    #[test]
    fn test_battery_level_in_range() {
        let device = SimDevice::new(3);
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let level = device.power_json(&mut rng)["power_state"]["battery_level"]
                .as_i64()
                .unwrap();
            assert!((0..=100).contains(&level));
        }
    }
}
