use crate::errors::{Error, Result};
use crate::model::{HubStatus, Reading, ReadingKind};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEmail {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Produces the body of one customer's digest.
#[async_trait]
pub trait DigestRenderer: Send + Sync {
    async fn render(&self, customer_id: Uuid, time_zone: Tz, reference: DateTime<Utc>)
        -> Result<String>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &DigestEmail) -> Result<()>;
}

/// Records outgoing digests in the log instead of delivering them.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &DigestEmail) -> Result<()> {
        if email.to.is_empty() {
            return Err(Error::Notification(format!("'{}' has no recipients", email.subject)));
        }
        info!(
            to = %email.to.join(","),
            cc = email.cc.len(),
            bcc = email.bcc.len(),
            "Digest '{}' ({} bytes)", email.subject, email.body.len()
        );
        Ok(())
    }
}

/// Plain-text summary of the 24 hours before the reference instant.
pub struct SummaryRenderer {
    store: Arc<dyn Store>,
}

#[derive(Default)]
struct DeviceSummary {
    motion_events: usize,
    last_motion: Option<DateTime<Utc>>,
    temperature: Option<f64>,
    battery: Option<i64>,
}

impl SummaryRenderer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn summarize(readings: &[Reading]) -> HashMap<Uuid, DeviceSummary> {
        let mut out: HashMap<Uuid, DeviceSummary> = HashMap::new();
        // Readings arrive newest first, so the first value seen is the latest.
        for reading in readings {
            let summary = out.entry(reading.device_id).or_default();
            match reading.kind {
                ReadingKind::Motion => {
                    if reading.value["motion"].as_bool() == Some(true) {
                        summary.motion_events += 1;
                        if summary.last_motion.is_none() {
                            summary.last_motion = Some(reading.timestamp);
                        }
                    }
                }
                ReadingKind::Temperature => {
                    if summary.temperature.is_none() {
                        summary.temperature = reading.value["temperature"].as_f64();
                    }
                }
                ReadingKind::Battery => {
                    if summary.battery.is_none() {
                        summary.battery = reading.value["battery"].as_i64();
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl DigestRenderer for SummaryRenderer {
    async fn render(
        &self,
        customer_id: Uuid,
        time_zone: Tz,
        reference: DateTime<Utc>,
    ) -> Result<String> {
        let hubs = self.store.hubs_for_customer(customer_id).await?;
        let mut body = String::new();

        for hub in &hubs {
            let _ = writeln!(body, "{}", hub.name);
            if hub.status == HubStatus::NeedsReauth {
                let _ = writeln!(body, "  Needs re-authorization: no data is being collected.");
            }

            let devices = self.store.devices_by_hub(hub.id).await?;
            if devices.is_empty() {
                let _ = writeln!(body, "  No devices reported yet.");
                continue;
            }

            let ids: Vec<Uuid> = devices.iter().map(|d| d.id).collect();
            let readings = self
                .store
                .readings_for_devices(&ids, reference - Duration::hours(24), reference, None)
                .await?;
            let summaries = Self::summarize(&readings);

            for device in &devices {
                let Some(summary) = summaries.get(&device.id) else {
                    let _ = writeln!(body, "  {}: no readings", device.name);
                    continue;
                };
                let mut line = format!("  {}:", device.name);
                if let Some(at) = summary.last_motion {
                    let _ = write!(
                        line,
                        " {} motion events, last at {}",
                        summary.motion_events,
                        at.with_timezone(&time_zone).format("%H:%M")
                    );
                }
                if let Some(t) = summary.temperature {
                    let _ = write!(line, " {:.1} °C", t);
                }
                if let Some(level) = summary.battery {
                    let _ = write!(line, " battery {}%", level);
                }
                let _ = writeln!(body, "{}", line);
            }
        }

        if hubs.is_empty() {
            body.push_str("No hubs are registered for this account.\n");
        }
        Ok(body)
    }
}
