//! Per-cycle fan-out over active hubs.
//!
//! Hubs are polled one after another. Each hub's resource fetches run
//! concurrently and are all joined before any accounting happens, so a hub's
//! log entry always reflects the complete outcome of its fetches. One hub's
//! failure never reaches another hub or the loop itself.

use crate::bridge::{
    BridgeApi, DevicePowerResource, DeviceResource, MotionResource, Resources,
    TemperatureResource,
};
use crate::config::PollingConfig;
use crate::errors::{Error, Result};
use crate::health::HealthEvaluator;
use crate::metrics::{
    POLLS_SKIPPED_TOTAL, POLLS_TOTAL, POLL_CYCLE_SECONDS, POLL_FAILURES_TOTAL,
    READINGS_INGESTED_TOTAL, READINGS_SKIPPED_TOTAL,
};
use crate::model::{Device, Hub, NewReading, PollingLogEntry, ReadingKind};
use crate::retention::RetentionSweeper;
use crate::store::Store;
use crate::validate::{validate_battery, validate_device_id, validate_temperature};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// Why a hub poll failed, derived from the bridge HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ExpiredToken,
    RateLimited,
    BridgeOffline,
    Other,
}

impl FailureKind {
    pub fn classify(err: &Error) -> Self {
        match err.http_status() {
            Some(401) => FailureKind::ExpiredToken,
            Some(429) => FailureKind::RateLimited,
            Some(503) => FailureKind::BridgeOffline,
            _ => FailureKind::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::ExpiredToken => "expired_token",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::BridgeOffline => "bridge_offline",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureKind::ExpiredToken => "Unauthorized (access token likely expired)",
            FailureKind::RateLimited => "Rate limited by bridge API",
            FailureKind::BridgeOffline => "Bridge offline",
            FailureKind::Other => "Polling failed",
        };
        f.write_str(text)
    }
}

/// Cuts `message` to at most `max` characters on a char boundary.
pub fn truncate_message(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub stored: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubPollResult {
    /// Token already expired; left to the token manager.
    Skipped,
    Succeeded { api_calls: i32, stats: IngestStats },
    Failed { api_calls: i32, kind: FailureKind, message: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

struct Snapshot {
    motion: Resources<MotionResource>,
    temperature: Resources<TemperatureResource>,
    devices: Resources<DeviceResource>,
    power: Option<Resources<DevicePowerResource>>,
}

pub struct PollingOrchestrator {
    store: Arc<dyn Store>,
    bridge: Arc<dyn BridgeApi>,
    config: PollingConfig,
    health: HealthEvaluator,
    retention: RetentionSweeper,
    // Forces a battery fetch on the first cycle after start-up.
    battery_poll_pending: bool,
}

impl PollingOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        bridge: Arc<dyn BridgeApi>,
        config: PollingConfig,
        health: HealthEvaluator,
        retention: RetentionSweeper,
    ) -> Self {
        Self {
            store,
            bridge,
            config,
            health,
            retention,
            battery_poll_pending: true,
        }
    }

    /// Polls immediately, then once per interval until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Starting polling loop with interval={:?}", self.config.interval);

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle(Utc::now()).await;
                }
            }
        }

        info!("Polling loop stopped");
    }

    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleSummary {
        let start = Instant::now();
        let mut summary = CycleSummary::default();

        let hubs = match self.store.active_hubs().await {
            Ok(hubs) => hubs,
            Err(e) => {
                error!("Failed to load active hubs: {}", e);
                return summary;
            }
        };

        let force_battery = self.battery_poll_pending;
        self.battery_poll_pending = false;
        debug!("Polling {} active hubs (force_battery={})", hubs.len(), force_battery);

        for hub in &hubs {
            match self.poll_hub(hub, now, force_battery).await {
                HubPollResult::Skipped => summary.skipped += 1,
                HubPollResult::Succeeded { .. } => summary.succeeded += 1,
                HubPollResult::Failed { .. } => summary.failed += 1,
            }
        }

        // Purge old data
        self.retention.sweep(self.store.as_ref(), now).await;

        let elapsed = start.elapsed().as_secs_f64();
        POLL_CYCLE_SECONDS.observe(elapsed);
        info!(
            "Polling cycle finished in {:.3}s: {} succeeded, {} failed, {} skipped",
            elapsed, summary.succeeded, summary.failed, summary.skipped
        );
        summary
    }

    pub async fn poll_hub(
        &self,
        hub: &Hub,
        now: DateTime<Utc>,
        force_battery: bool,
    ) -> HubPollResult {
        // Expired token: leave it to the refresh loop
        if hub.token_expires_at <= now {
            POLLS_SKIPPED_TOTAL.inc();
            info!(
                hub_id = %hub.id,
                bridge_id = %hub.bridge_id,
                "Skipping hub with expired access token"
            );
            return HubPollResult::Skipped;
        }

        POLLS_TOTAL.inc();

        // Battery is polled on start-up and then once per battery interval
        let poll_battery = force_battery
            || hub
                .last_battery_poll_at
                .map_or(true, |at| now - at >= self.config.battery_interval);

        let (api_calls, fetched) = self.fetch_snapshot(hub, poll_battery).await;
        let ingested = match fetched {
            Ok(snapshot) => self.ingest(hub, snapshot, now).await,
            Err(e) => Err(e),
        };

        // Update hub accounting
        let (result, consecutive_failures, last_success_at) = match ingested {
            Ok(stats) => {
                if let Err(e) = self.store.record_poll_success(hub.id, now, poll_battery).await {
                    error!(hub_id = %hub.id, "Failed to record poll success: {}", e);
                }
                debug!(
                    hub_id = %hub.id,
                    "Polled hub: {} readings stored, {} skipped", stats.stored, stats.skipped
                );
                (HubPollResult::Succeeded { api_calls, stats }, 0, Some(now))
            }
            Err(e) => {
                let kind = FailureKind::classify(&e);
                let message = truncate_message(&format!("{}: {}", kind, e), MAX_ERROR_MESSAGE_CHARS);
                POLL_FAILURES_TOTAL.with_label_values(&[kind.label()]).inc();
                warn!(
                    hub_id = %hub.id,
                    bridge_id = %hub.bridge_id,
                    kind = kind.label(),
                    "Hub poll failed: {}", message
                );
                if let Err(e) = self.store.record_poll_failure(hub.id, now).await {
                    error!(hub_id = %hub.id, "Failed to record poll failure: {}", e);
                }
                (
                    HubPollResult::Failed { api_calls, kind, message },
                    hub.consecutive_failures.saturating_add(1),
                    hub.last_success_at,
                )
            }
        };

        self.write_log(hub, now, &result).await;

        // Health check
        if self.health.needs_attention(last_success_at, consecutive_failures, now) {
            warn!(
                hub_id = %hub.id,
                bridge_id = %hub.bridge_id,
                consecutive_failures,
                "Hub needs attention"
            );
        }

        result
    }

    async fn fetch_snapshot(&self, hub: &Hub, poll_battery: bool) -> (i32, Result<Snapshot>) {
        let token = hub.access_token.as_str();
        let key = self.config.application_key.as_str();

        let power = async {
            if poll_battery {
                Some(self.bridge.fetch_device_power(token, key).await)
            } else {
                None
            }
        };
        let (motion, temperature, devices, power) = tokio::join!(
            self.bridge.fetch_motion_sensors(token, key),
            self.bridge.fetch_temperature_sensors(token, key),
            self.bridge.fetch_devices(token, key),
            power,
        );

        let api_calls = if poll_battery { 4 } else { 3 };
        let snapshot = (|| -> Result<Snapshot> {
            Ok(Snapshot {
                motion: motion?,
                temperature: temperature?,
                devices: devices?,
                power: power.transpose()?,
            })
        })();
        (api_calls, snapshot)
    }

    async fn ingest(
        &self,
        hub: &Hub,
        snapshot: Snapshot,
        now: DateTime<Utc>,
    ) -> Result<IngestStats> {
        let known = self.store.devices_by_hub(hub.id).await?;
        let mut resolver =
            DeviceResolver::new(self.store.as_ref(), hub.id, &snapshot.devices, known);
        let mut stats = IngestStats {
            stored: 0,
            skipped: snapshot.motion.malformed
                + snapshot.temperature.malformed
                + snapshot.power.as_ref().map_or(0, |p| p.malformed),
        };

        for sensor in &snapshot.motion.items {
            let Some(report) = sensor.motion.as_ref().and_then(|m| m.motion_report.as_ref())
            else {
                continue;
            };
            let value = json!({ "motion": report.motion, "changed": report.changed });
            self.store_reading(
                &mut resolver,
                &sensor.owner.rid,
                ReadingKind::Motion,
                value,
                now,
                &mut stats,
            )
            .await;
        }

        for sensor in &snapshot.temperature.items {
            let Some(report) = sensor
                .temperature
                .as_ref()
                .and_then(|t| t.temperature_report.as_ref())
            else {
                continue;
            };
            if let Err(e) = validate_temperature(report.temperature) {
                warn!(hub_id = %hub.id, sensor = %sensor.id, "Skipping reading: {}", e);
                stats.skipped += 1;
                continue;
            }
            let value = json!({ "temperature": report.temperature, "changed": report.changed });
            self.store_reading(
                &mut resolver,
                &sensor.owner.rid,
                ReadingKind::Temperature,
                value,
                now,
                &mut stats,
            )
            .await;
        }

        for sensor in snapshot.power.iter().flat_map(|p| p.items.iter()) {
            let Some(state) = sensor.power_state.as_ref() else {
                continue;
            };
            let Some(level) = state.battery_level else {
                continue;
            };
            if let Err(e) = validate_battery(level) {
                warn!(hub_id = %hub.id, sensor = %sensor.id, "Skipping reading: {}", e);
                stats.skipped += 1;
                continue;
            }
            let value = json!({ "battery": level, "state": state.battery_state });
            self.store_reading(
                &mut resolver,
                &sensor.owner.rid,
                ReadingKind::Battery,
                value,
                now,
                &mut stats,
            )
            .await;
        }

        READINGS_INGESTED_TOTAL.inc_by(stats.stored as f64);
        READINGS_SKIPPED_TOTAL.inc_by(stats.skipped as f64);
        Ok(stats)
    }

    async fn store_reading(
        &self,
        resolver: &mut DeviceResolver<'_>,
        owner_id: &str,
        kind: ReadingKind,
        value: serde_json::Value,
        now: DateTime<Utc>,
        stats: &mut IngestStats,
    ) {
        if let Err(e) = validate_device_id(owner_id) {
            warn!("Skipping {} reading: {}", kind, e);
            stats.skipped += 1;
            return;
        }

        let device = match resolver.resolve(owner_id).await {
            Ok(device) => device,
            Err(e) => {
                warn!(owner_id, "Skipping {} reading, device lookup failed: {}", kind, e);
                stats.skipped += 1;
                return;
            }
        };

        let reading = NewReading {
            device_id: device.id,
            timestamp: now,
            kind,
            value,
        };
        match self.store.insert_reading(&reading).await {
            Ok(()) => stats.stored += 1,
            Err(e) => {
                warn!(device_id = %device.id, "Failed to store {} reading: {}", kind, e);
                stats.skipped += 1;
            }
        }
    }

    async fn write_log(&self, hub: &Hub, now: DateTime<Utc>, result: &HubPollResult) {
        let entry = match result {
            HubPollResult::Skipped => return,
            HubPollResult::Succeeded { api_calls, .. } => PollingLogEntry {
                hub_id: hub.id,
                timestamp: now,
                success: true,
                error_message: None,
                api_calls: *api_calls,
            },
            HubPollResult::Failed {
                api_calls, message, ..
            } => PollingLogEntry {
                hub_id: hub.id,
                timestamp: now,
                success: false,
                error_message: Some(message.clone()),
                api_calls: *api_calls,
            },
        };

        if let Err(e) = self.store.insert_polling_log(&entry).await {
            error!(hub_id = %hub.id, "Failed to write polling log: {}", e);
        }
    }
}

/// Maps bridge owner ids to device rows, creating or renaming rows as the
/// catalog dictates.
struct DeviceResolver<'a> {
    store: &'a dyn Store,
    hub_id: uuid::Uuid,
    catalog: HashMap<&'a str, &'a DeviceResource>,
    known: HashMap<String, Device>,
}

impl<'a> DeviceResolver<'a> {
    fn new(
        store: &'a dyn Store,
        hub_id: uuid::Uuid,
        catalog: &'a Resources<DeviceResource>,
        known: Vec<Device>,
    ) -> Self {
        Self {
            store,
            hub_id,
            catalog: catalog.items.iter().map(|d| (d.id.as_str(), d)).collect(),
            known: known
                .into_iter()
                .map(|d| (d.bridge_device_id.clone(), d))
                .collect(),
        }
    }

    async fn resolve(&mut self, owner_id: &str) -> Result<Device> {
        let catalog_name = self.catalog.get(owner_id).and_then(|d| d.name());

        if let Some(device) = self.known.get_mut(owner_id) {
            if let Some(name) = catalog_name {
                if name != device.name {
                    match self.store.rename_device(device.id, name).await {
                        Ok(()) => {
                            info!(device_id = %device.id, "Renamed device '{}' to '{}'", device.name, name);
                            device.name = name.to_string();
                        }
                        Err(e) => warn!(device_id = %device.id, "Failed to rename device: {}", e),
                    }
                }
            }
            return Ok(device.clone());
        }

        let name = catalog_name.unwrap_or(UNKNOWN_DEVICE_NAME);
        let device = self.store.insert_device(self.hub_id, owner_id, name).await?;
        info!(hub_id = %self.hub_id, device_id = %device.id, "Discovered device '{}'", name);
        self.known.insert(owner_id.to_string(), device.clone());
        Ok(device)
    }
}
