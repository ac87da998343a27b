use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a hub.
///
/// `NeedsReauth` is only entered by the token manager once refresh retries
/// are exhausted, and only left through a manual re-activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubStatus {
    Active,
    Inactive,
    NeedsReauth,
}

impl HubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubStatus::Active => "active",
            HubStatus::Inactive => "inactive",
            HubStatus::NeedsReauth => "needs_reauth",
        }
    }
}

impl fmt::Display for HubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HubStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(HubStatus::Active),
            "inactive" => Ok(HubStatus::Inactive),
            "needs_reauth" => Ok(HubStatus::NeedsReauth),
            other => Err(Error::Validation(format!("unknown hub status '{}'", other))),
        }
    }
}

/// One customer bridge and its OAuth credentials.
#[derive(Debug, Clone, Serialize)]
pub struct Hub {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub bridge_id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub status: HubStatus,
    pub consecutive_failures: i32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_battery_poll_at: Option<DateTime<Utc>>,
}

/// A sensor device behind a hub, unique per `(hub_id, bridge_device_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub hub_id: Uuid,
    pub bridge_device_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    Motion,
    Temperature,
    Battery,
}

impl ReadingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingKind::Motion => "motion",
            ReadingKind::Temperature => "temperature",
            ReadingKind::Battery => "battery",
        }
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "motion" => Ok(ReadingKind::Motion),
            "temperature" => Ok(ReadingKind::Temperature),
            "battery" => Ok(ReadingKind::Battery),
            other => Err(Error::Validation(format!("unknown reading kind '{}'", other))),
        }
    }
}

/// Stored sensor observation. Rows are append-only.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub id: i64,
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ReadingKind,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub device_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ReadingKind,
    pub value: serde_json::Value,
}

/// Audit record of one polling attempt against one hub.
#[derive(Debug, Clone, Serialize)]
pub struct PollingLogEntry {
    pub hub_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    pub api_calls: i32,
}

/// A digest recipient.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub time_zone: String,
    pub email_to: String,
    pub email_cc: Option<String>,
    pub email_bcc: Option<String>,
}

/// Fresh credentials returned by the bridge token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: i64,
}
