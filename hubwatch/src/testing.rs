//! In-memory fakes of the storage interface and the bridge client.

use crate::bridge::{
    BridgeApi, DeviceMetadata, DevicePowerResource, DeviceResource, MotionReport, MotionResource,
    MotionState, PowerState, ResourceRef, Resources, TemperatureReport, TemperatureResource,
    TemperatureState,
};
use crate::errors::{Error, Result};
use crate::model::{
    Customer, Device, Hub, HubStatus, NewReading, PollingLogEntry, Reading, ReadingKind,
    TokenGrant,
};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    hubs: Vec<Hub>,
    devices: Vec<Device>,
    readings: Vec<Reading>,
    poll_logs: Vec<PollingLogEntry>,
    customers: Vec<Customer>,
    next_reading_id: i64,
    fail_deletes: bool,
    fail_poll_logs: bool,
    fail_recipients: bool,
    recipient_loads: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an active hub whose token is valid for a week, after letting
    /// `customize` adjust it.
    pub fn add_hub(&self, customize: impl FnOnce(&mut Hub)) -> Hub {
        let mut hub = Hub {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            bridge_id: format!("bridge-{}", Uuid::new_v4().simple()),
            name: "Test hub".to_string(),
            access_token: "access-0".to_string(),
            refresh_token: "refresh-0".to_string(),
            token_expires_at: Utc::now() + Duration::days(7),
            status: HubStatus::Active,
            consecutive_failures: 0,
            last_polled_at: None,
            last_success_at: None,
            last_battery_poll_at: None,
        };
        customize(&mut hub);
        self.state.lock().unwrap().hubs.push(hub.clone());
        hub
    }

    pub fn add_device(&self, hub_id: Uuid, bridge_device_id: &str, name: &str) -> Device {
        let device = Device {
            id: Uuid::new_v4(),
            hub_id,
            bridge_device_id: bridge_device_id.to_string(),
            name: name.to_string(),
        };
        self.state.lock().unwrap().devices.push(device.clone());
        device
    }

    pub fn add_reading(&self, device_id: Uuid, timestamp: DateTime<Utc>, kind: ReadingKind) {
        let value = match kind {
            ReadingKind::Motion => serde_json::json!({ "motion": true }),
            ReadingKind::Temperature => serde_json::json!({ "temperature": 21.0 }),
            ReadingKind::Battery => serde_json::json!({ "battery": 80 }),
        };
        self.push_reading(NewReading {
            device_id,
            timestamp,
            kind,
            value,
        });
    }

    pub fn add_poll_log(&self, hub_id: Uuid, timestamp: DateTime<Utc>) {
        self.state.lock().unwrap().poll_logs.push(PollingLogEntry {
            hub_id,
            timestamp,
            success: true,
            error_message: None,
            api_calls: 3,
        });
    }

    pub fn add_customer(&self, customer: Customer) {
        self.state.lock().unwrap().customers.push(customer);
    }

    pub fn hub(&self, id: Uuid) -> Hub {
        self.state
            .lock()
            .unwrap()
            .hubs
            .iter()
            .find(|h| h.id == id)
            .cloned()
            .unwrap()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.state.lock().unwrap().devices.clone()
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.state.lock().unwrap().readings.clone()
    }

    pub fn poll_logs(&self) -> Vec<PollingLogEntry> {
        self.state.lock().unwrap().poll_logs.clone()
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    pub fn fail_poll_logs(&self, fail: bool) {
        self.state.lock().unwrap().fail_poll_logs = fail;
    }

    pub fn fail_recipients(&self, fail: bool) {
        self.state.lock().unwrap().fail_recipients = fail;
    }

    pub fn recipient_loads(&self) -> usize {
        self.state.lock().unwrap().recipient_loads
    }

    fn push_reading(&self, reading: NewReading) {
        let mut state = self.state.lock().unwrap();
        state.next_reading_id += 1;
        let id = state.next_reading_id;
        state.readings.push(Reading {
            id,
            device_id: reading.device_id,
            timestamp: reading.timestamp,
            kind: reading.kind,
            value: reading.value,
        });
    }

    fn update_hub(&self, hub_id: Uuid, f: impl FnOnce(&mut Hub)) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let hub = state
            .hubs
            .iter_mut()
            .find(|h| h.id == hub_id)
            .ok_or_else(|| Error::NotFound(format!("hub {}", hub_id)))?;
        f(hub);
        Ok(())
    }

    fn injected() -> Error {
        Error::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hubs_by_status(&self, status: HubStatus) -> Result<Vec<Hub>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hubs
            .iter()
            .filter(|h| h.status == status)
            .cloned()
            .collect())
    }

    async fn all_hubs(&self) -> Result<Vec<Hub>> {
        Ok(self.state.lock().unwrap().hubs.clone())
    }

    async fn hubs_for_customer(&self, customer_id: Uuid) -> Result<Vec<Hub>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .hubs
            .iter()
            .filter(|h| h.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn record_poll_success(
        &self,
        hub_id: Uuid,
        at: DateTime<Utc>,
        battery_polled: bool,
    ) -> Result<()> {
        self.update_hub(hub_id, |hub| {
            hub.last_polled_at = Some(at);
            hub.last_success_at = Some(at);
            hub.consecutive_failures = 0;
            if battery_polled {
                hub.last_battery_poll_at = Some(at);
            }
        })
    }

    async fn record_poll_failure(&self, hub_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.update_hub(hub_id, |hub| {
            hub.last_polled_at = Some(at);
            hub.consecutive_failures += 1;
        })
    }

    async fn update_tokens(
        &self,
        hub_id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_hub(hub_id, |hub| {
            hub.access_token = access_token.to_string();
            if let Some(rt) = refresh_token {
                hub.refresh_token = rt.to_string();
            }
            hub.token_expires_at = expires_at;
        })
    }

    async fn set_hub_status(&self, hub_id: Uuid, status: HubStatus) -> Result<()> {
        self.update_hub(hub_id, |hub| hub.status = status)
    }

    async fn reactivate_hub(&self, hub_id: Uuid) -> Result<()> {
        self.update_hub(hub_id, |hub| {
            hub.status = HubStatus::Active;
            hub.consecutive_failures = 0;
        })
    }

    async fn devices_by_hub(&self, hub_id: Uuid) -> Result<Vec<Device>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .devices
            .iter()
            .filter(|d| d.hub_id == hub_id)
            .cloned()
            .collect())
    }

    async fn insert_device(
        &self,
        hub_id: Uuid,
        bridge_device_id: &str,
        name: &str,
    ) -> Result<Device> {
        Ok(self.add_device(hub_id, bridge_device_id, name))
    }

    async fn rename_device(&self, device_id: Uuid, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.devices.iter_mut().find(|d| d.id == device_id) {
            device.name = name.to_string();
        }
        Ok(())
    }

    async fn insert_reading(&self, reading: &NewReading) -> Result<()> {
        self.push_reading(reading.clone());
        Ok(())
    }

    async fn readings_for_devices(
        &self,
        device_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Reading>> {
        let mut out: Vec<Reading> = self
            .state
            .lock()
            .unwrap()
            .readings
            .iter()
            .filter(|r| device_ids.contains(&r.device_id) && r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn insert_polling_log(&self, entry: &PollingLogEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_poll_logs {
            return Err(Self::injected());
        }
        state.poll_logs.push(entry.clone());
        Ok(())
    }

    async fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(Self::injected());
        }
        let before = state.readings.len();
        state.readings.retain(|r| r.timestamp >= cutoff);
        Ok((before - state.readings.len()) as u64)
    }

    async fn delete_polling_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(Self::injected());
        }
        let before = state.poll_logs.len();
        state.poll_logs.retain(|l| l.timestamp >= cutoff);
        Ok((before - state.poll_logs.len()) as u64)
    }

    async fn digest_recipients(&self) -> Result<Vec<Customer>> {
        let mut state = self.state.lock().unwrap();
        state.recipient_loads += 1;
        if state.fail_recipients {
            return Err(Self::injected());
        }
        Ok(state.customers.clone())
    }
}

#[derive(Default)]
struct BridgeState {
    motion: Vec<MotionResource>,
    temperature: Vec<TemperatureResource>,
    devices: Vec<DeviceResource>,
    power: Vec<DevicePowerResource>,
    fail_status: Option<u16>,
    fail_only: Option<&'static str>,
    fail_token: Option<(String, u16)>,
    token_responses: VecDeque<std::result::Result<TokenGrant, u16>>,
    resource_calls: Vec<(&'static str, String)>,
    token_calls: Vec<String>,
}

/// Canned bridge responses with call recording.
#[derive(Default)]
pub struct FakeBridge {
    state: Mutex<BridgeState>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_motion(self, items: Vec<MotionResource>) -> Self {
        self.state.lock().unwrap().motion = items;
        self
    }

    pub fn with_temperature(self, items: Vec<TemperatureResource>) -> Self {
        self.state.lock().unwrap().temperature = items;
        self
    }

    pub fn with_devices(self, items: Vec<DeviceResource>) -> Self {
        self.state.lock().unwrap().devices = items;
        self
    }

    pub fn with_power(self, items: Vec<DevicePowerResource>) -> Self {
        self.state.lock().unwrap().power = items;
        self
    }

    /// Every resource fetch fails with `status`.
    pub fn failing(self, status: u16) -> Self {
        self.state.lock().unwrap().fail_status = Some(status);
        self
    }

    /// Only the named resource fetch fails with `status`.
    pub fn failing_resource(self, resource: &'static str, status: u16) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.fail_status = Some(status);
            state.fail_only = Some(resource);
        }
        self
    }

    /// Resource fetches made with `access_token` fail with `status`.
    pub fn failing_for_token(self, access_token: &str, status: u16) -> Self {
        self.state.lock().unwrap().fail_token = Some((access_token.to_string(), status));
        self
    }

    pub fn push_token_grant(&self, grant: TokenGrant) {
        self.state.lock().unwrap().token_responses.push_back(Ok(grant));
    }

    pub fn push_token_failure(&self, status: u16) {
        self.state.lock().unwrap().token_responses.push_back(Err(status));
    }

    pub fn resource_calls(&self) -> Vec<(&'static str, String)> {
        self.state.lock().unwrap().resource_calls.clone()
    }

    pub fn calls_for(&self, resource: &str) -> usize {
        self.resource_calls()
            .iter()
            .filter(|(r, _)| *r == resource)
            .count()
    }

    pub fn token_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().token_calls.clone()
    }

    fn record(&self, resource: &'static str, access_token: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.resource_calls.push((resource, access_token.to_string()));
        if let Some((token, status)) = &state.fail_token {
            if token == access_token {
                return Err(protocol(*status));
            }
        }
        match (state.fail_status, state.fail_only) {
            (Some(status), None) => Err(protocol(status)),
            (Some(status), Some(only)) if only == resource => Err(protocol(status)),
            _ => Ok(()),
        }
    }
}

fn protocol(status: u16) -> Error {
    Error::Protocol {
        status,
        message: "injected failure".to_string(),
    }
}

#[async_trait]
impl BridgeApi for FakeBridge {
    async fn fetch_motion_sensors(
        &self,
        access_token: &str,
        _application_key: &str,
    ) -> Result<Resources<MotionResource>> {
        self.record("motion", access_token)?;
        Ok(self.state.lock().unwrap().motion.clone().into())
    }

    async fn fetch_temperature_sensors(
        &self,
        access_token: &str,
        _application_key: &str,
    ) -> Result<Resources<TemperatureResource>> {
        self.record("temperature", access_token)?;
        Ok(self.state.lock().unwrap().temperature.clone().into())
    }

    async fn fetch_devices(
        &self,
        access_token: &str,
        _application_key: &str,
    ) -> Result<Resources<DeviceResource>> {
        self.record("device", access_token)?;
        Ok(self.state.lock().unwrap().devices.clone().into())
    }

    async fn fetch_device_power(
        &self,
        access_token: &str,
        _application_key: &str,
    ) -> Result<Resources<DevicePowerResource>> {
        self.record("device_power", access_token)?;
        Ok(self.state.lock().unwrap().power.clone().into())
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        let mut state = self.state.lock().unwrap();
        state.token_calls.push(refresh_token.to_string());
        match state.token_responses.pop_front() {
            Some(Ok(grant)) => Ok(grant),
            Some(Err(status)) => Err(protocol(status)),
            None => Err(protocol(500)),
        }
    }
}

fn owner(device_id: &str) -> ResourceRef {
    ResourceRef {
        rid: device_id.to_string(),
        rtype: "device".to_string(),
    }
}

pub fn motion(device_id: &str, detected: bool, changed: DateTime<Utc>) -> MotionResource {
    MotionResource {
        id: format!("motion-{}", device_id),
        owner: owner(device_id),
        motion: Some(MotionState {
            motion_report: Some(MotionReport {
                changed,
                motion: detected,
            }),
        }),
    }
}

pub fn motion_without_report(device_id: &str) -> MotionResource {
    MotionResource {
        id: format!("motion-{}", device_id),
        owner: owner(device_id),
        motion: Some(MotionState {
            motion_report: None,
        }),
    }
}

pub fn temperature(device_id: &str, celsius: f64, changed: DateTime<Utc>) -> TemperatureResource {
    TemperatureResource {
        id: format!("temperature-{}", device_id),
        owner: owner(device_id),
        temperature: Some(TemperatureState {
            temperature_report: Some(TemperatureReport {
                changed,
                temperature: celsius,
            }),
        }),
    }
}

pub fn device(device_id: &str, name: &str) -> DeviceResource {
    DeviceResource {
        id: device_id.to_string(),
        metadata: Some(DeviceMetadata {
            name: name.to_string(),
        }),
    }
}

pub fn power(device_id: &str, level: i64) -> DevicePowerResource {
    DevicePowerResource {
        id: format!("power-{}", device_id),
        owner: owner(device_id),
        power_state: Some(PowerState {
            battery_state: Some("normal".to_string()),
            battery_level: Some(level),
        }),
    }
}

pub fn grant(access_token: &str, refresh_token: Option<&str>, expires_in: i64) -> TokenGrant {
    TokenGrant {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        token_type: Some("bearer".to_string()),
        expires_in,
    }
}
