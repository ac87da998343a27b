use crate::errors::{Error, Result};

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const BATTERY_MIN: i64 = 0;
const BATTERY_MAX: i64 = 100;

/// Rejects temperatures no indoor sensor can report.
pub fn validate_temperature(celsius: f64) -> Result<()> {
    // NaN and infinities never pass
    if !celsius.is_finite() || !(TEMP_MIN..=TEMP_MAX).contains(&celsius) {
        return Err(Error::Validation(format!(
            "Temperature {} out of range [{}, {}]",
            celsius, TEMP_MIN, TEMP_MAX
        )));
    }
    Ok(())
}

pub fn validate_battery(level: i64) -> Result<()> {
    if !(BATTERY_MIN..=BATTERY_MAX).contains(&level) {
        return Err(Error::Validation(format!(
            "Battery {} out of range [{}, {}]",
            level, BATTERY_MIN, BATTERY_MAX
        )));
    }
    Ok(())
}

pub fn validate_device_id(owner_id: &str) -> Result<()> {
    if owner_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }
    Ok(())
}
